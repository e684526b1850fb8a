//! Replay driver: archive reader into dispatcher.
//!
//! The reader is only polled while the dispatcher holds fewer than
//! `replay.max_pending` requests, so memory stays flat for any archive size.
//! A reader failure or a shutdown signal clears the queue; in-flight
//! exchanges are always drained before returning.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::archive::{ArchiveError, ArchiveReader};
use crate::config::ToolConfig;
use crate::replay::dispatcher::Dispatcher;
use crate::replay::error::ReplayError;
use crate::replay::listener::ResultListener;
use crate::session::ContextStore;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Requests handed to the dispatcher.
    pub submitted: u64,
    /// Requests dropped from the queue by an early stop.
    pub dropped: usize,
    /// True when a shutdown signal ended the run early.
    pub interrupted: bool,
}

enum Step {
    Continue,
    Finished,
    Interrupted,
    Failed(ArchiveError),
}

pub async fn replay_archive(
    config: &ToolConfig,
    archive: &Path,
    listener: Arc<dyn ResultListener>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<RunSummary, ReplayError> {
    let mut reader = ArchiveReader::open(archive, &config.replay.upload_root)?;
    let store = Arc::new(ContextStore::new(config.session.lock_timeout()));
    let dispatcher = Arc::new(Dispatcher::new(&config.replay, &config.session, store, listener));
    let scheduler = tokio::spawn(Arc::clone(&dispatcher).run());

    tracing::info!(
        archive = %archive.display(),
        target = %config.replay.target,
        "Replay started"
    );

    let mut summary = RunSummary::default();
    let mut failure = None;

    loop {
        let step = if dispatcher.pending_len() >= config.replay.max_pending {
            tokio::select! {
                Ok(()) = shutdown.recv() => Step::Interrupted,
                _ = tokio::time::sleep(config.replay.poll_interval()) => Step::Continue,
            }
        } else {
            tokio::select! {
                Ok(()) = shutdown.recv() => Step::Interrupted,
                item = reader.read_next() => match item {
                    Ok(item) => {
                        let last = item.is_final();
                        if item.request().is_some() {
                            summary.submitted += 1;
                        }
                        dispatcher.submit(item);
                        if last { Step::Finished } else { Step::Continue }
                    }
                    Err(e) => Step::Failed(e),
                },
            }
        };

        match step {
            Step::Continue => {}
            Step::Finished => break,
            Step::Interrupted => {
                tracing::warn!("Shutdown requested, abandoning remaining requests");
                summary.interrupted = true;
                summary.dropped = dispatcher.clear_queue();
                break;
            }
            Step::Failed(e) => {
                tracing::error!(error = %e, submitted = summary.submitted, "Archive read failed, aborting replay");
                summary.dropped = dispatcher.clear_queue();
                failure = Some(e);
                break;
            }
        }
    }

    // Once the input is closed the loop ends by itself after the last fire;
    // a shutdown during that tail still cuts it short.
    if !summary.interrupted && failure.is_none() {
        tokio::pin!(scheduler);
        tokio::select! {
            joined = &mut scheduler => joined?,
            Ok(()) = shutdown.recv() => {
                tracing::warn!("Shutdown requested, abandoning remaining requests");
                summary.interrupted = true;
                summary.dropped = dispatcher.clear_queue();
                scheduler.await?;
            }
        }
    } else {
        scheduler.await?;
    }

    dispatcher.shutdown().await;

    match failure {
        Some(e) => Err(ReplayError::Archive(e)),
        None => {
            tracing::info!(
                submitted = summary.submitted,
                dropped = summary.dropped,
                interrupted = summary.interrupted,
                "Replay finished"
            );
            Ok(summary)
        }
    }
}
