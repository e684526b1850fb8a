//! One replayed request/response exchange.
//!
//! # Flow
//! ```text
//! gate ticket? → wait for the gate (bounded)
//!     → encode → send (bounded) → apply Set-Cookie → release gate
//!     → read body (bounded) → HTML scan on GET → report
//! ```
//!
//! Every failure is reported to the result listener; nothing propagates to
//! the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header;
use chrono::Utc;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config::{ReplayConfig, SessionConfig};
use crate::observability::metrics;
use crate::replay::connection::ConnectionGuard;
use crate::replay::encoder::RequestEncoder;
use crate::replay::error::ExchangeError;
use crate::replay::listener::{ResultListener, SampleResult};
use crate::replay::request::ReplayRequest;
use crate::session::{html, GateTicket, UserAgent};

/// Shared by every exchange of one run.
pub struct ExchangeContext {
    client: Client<HttpConnector, Body>,
    encoder: RequestEncoder,
    listener: Arc<dyn ResultListener>,
    stateless: Arc<UserAgent>,
    override_fields: Vec<String>,
    gate_timeout: Duration,
    request_timeout: Duration,
    max_response_bytes: usize,
    fail_on_status_mismatch: bool,
}

impl ExchangeContext {
    pub fn new(
        replay: &ReplayConfig,
        session: &SessionConfig,
        listener: Arc<dyn ResultListener>,
        stateless: Arc<UserAgent>,
    ) -> Self {
        // A fresh connection per exchange, as the recorded client would have.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(HttpConnector::new());
        Self {
            client,
            encoder: RequestEncoder::new(replay.target.clone(), session),
            listener,
            stateless,
            override_fields: session.override_fields.clone(),
            gate_timeout: session.gate_timeout(),
            request_timeout: replay.request_timeout(),
            max_response_bytes: replay.max_response_bytes,
            fail_on_status_mismatch: replay.fail_on_status_mismatch,
        }
    }

    pub fn listener(&self) -> &Arc<dyn ResultListener> {
        &self.listener
    }

    /// A result skeleton for `request`, before anything is known.
    pub fn sample(&self, request: &ReplayRequest) -> SampleResult {
        SampleResult {
            label: request.label(),
            url: self.encoder.url(request),
            expected_status: request.expected.as_ref().map(|e| e.status),
            ..SampleResult::default()
        }
    }
}

/// Run one exchange to completion and report it. `ticket` is the gate place
/// reserved for a blocking request; `_guard` keeps the exchange counted as
/// live until this returns.
pub async fn run(
    ctx: Arc<ExchangeContext>,
    request: ReplayRequest,
    ticket: Option<GateTicket>,
    _guard: ConnectionGuard,
) {
    let start = Instant::now();
    let mut result = ctx.sample(&request);

    let outcome = execute(&ctx, &request, ticket, &mut result, start).await;
    result.elapsed = start.elapsed();

    match outcome {
        Ok(()) => {
            metrics::record_replay("success", start);
            ctx.listener.on_success(&result);
        }
        Err(e) => {
            metrics::record_replay(outcome_label(&e), start);
            ctx.listener.on_failure(&result, &e);
        }
    }
}

fn outcome_label(error: &ExchangeError) -> &'static str {
    match error {
        ExchangeError::Encode(_) => "encode_error",
        ExchangeError::Session(_) => "session_error",
        ExchangeError::Send(_) => "send_error",
        ExchangeError::Timeout(_) => "timeout",
        ExchangeError::StatusMismatch { .. } => "status_mismatch",
        ExchangeError::Body(_) => "body_error",
    }
}

async fn execute(
    ctx: &ExchangeContext,
    request: &ReplayRequest,
    ticket: Option<GateTicket>,
    result: &mut SampleResult,
    start: Instant,
) -> Result<(), ExchangeError> {
    let agent = request.session.as_ref().unwrap_or(&ctx.stateless);

    let permit = match ticket {
        Some(ticket) => {
            let permit = ticket.acquire(ctx.gate_timeout).await?;
            metrics::record_gate_wait(start);
            Some(permit)
        }
        None => None,
    };

    let wire = ctx.encoder.encode(request, agent).await?;
    tracing::debug!(
        request = %result.label,
        session = ?agent.key(),
        blocking = request.blocking,
        waited_ms = start.elapsed().as_millis() as u64,
        "Sending"
    );

    let response = match tokio::time::timeout(ctx.request_timeout, ctx.client.request(wire)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(ExchangeError::Send(e.to_string())),
        Err(_) => return Err(ExchangeError::Timeout(ctx.request_timeout)),
    };

    let (parts, body) = response.into_parts();
    let status = parts.status.as_u16();
    result.status = Some(status);

    if agent.is_tracked() {
        let set_cookies = parts
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok());
        agent.apply_set_cookies(set_cookies, Utc::now())?;
    }
    // Gate released only once the live cookies are in place.
    drop(permit);

    let bytes = match tokio::time::timeout(
        ctx.request_timeout,
        axum::body::to_bytes(Body::new(body), ctx.max_response_bytes),
    )
    .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(ExchangeError::Body(e.to_string())),
        Err(_) => return Err(ExchangeError::Timeout(ctx.request_timeout)),
    };
    result.bytes_read = bytes.len() as u64;

    let is_html = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(html::is_html);
    if is_html {
        let document = html::scan(&String::from_utf8_lossy(&bytes), &ctx.override_fields);
        if request.is_get() && agent.is_tracked() {
            for field in &document.hidden_fields {
                agent.set_override(field.clone())?;
            }
        }
        result.document = Some(document);
    }

    match result.expected_status {
        Some(expected) if expected != status && ctx.fail_on_status_mismatch => {
            Err(ExchangeError::StatusMismatch {
                expected,
                actual: status,
            })
        }
        _ => Ok(()),
    }
}
