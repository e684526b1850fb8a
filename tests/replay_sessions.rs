//! End-to-end replay against a mock target: session rewriting, gate
//! ordering, failure reporting and early stop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use capture_replay::lifecycle::Shutdown;
use capture_replay::replay::{replay_archive, ReplayError, ReplayStats};

use common::{entry, replay_config, request, response, start_backend, write_har, MockResponse};

fn form(path: &str, cookie: &str, body: &[(&str, &str)]) -> serde_json::Value {
    let mut req = request(
        "POST",
        path,
        json!([
            { "name": "Cookie", "value": cookie },
            { "name": "Content-Type", "value": "application/x-www-form-urlencoded" }
        ]),
    );
    req["postData"] = json!({
        "mimeType": "application/x-www-form-urlencoded",
        "params": body
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect::<Vec<_>>()
    });
    req
}

#[tokio::test]
async fn live_session_and_hidden_fields_replace_recorded_values() {
    let backend = start_backend(|req| match req.path.as_str() {
        "/login" => MockResponse::ok("welcome").header("Set-Cookie", "JSESSIONID=LIVE1; Path=/"),
        "/account" => MockResponse::ok(
            r#"<html><head><title>Account</title></head><body><form>
               <input type="hidden" name="csrf_token" value="live-token">
               <input type="text" name="amount"></form></body></html>"#,
        )
        .html(),
        _ => MockResponse::ok("done"),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![
            entry(
                0,
                request("POST", "/login", json!([])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC1; Path=/" }])),
            ),
            entry(
                200,
                request("GET", "/account", json!([{ "name": "Cookie", "value": "JSESSIONID=REC1" }])),
                response(200, json!([])),
            ),
            entry(
                400,
                form(
                    "/transfer",
                    "JSESSIONID=REC1; theme=dark",
                    &[("csrf_token", "recorded-token"), ("amount", "5")],
                ),
                response(200, json!([])),
            ),
        ],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let shutdown = Shutdown::new();
    let summary = replay_archive(&config, &archive, stats.clone(), shutdown.subscribe())
        .await
        .unwrap();

    assert_eq!(summary.submitted, 3);
    assert!(!summary.interrupted);
    assert_eq!(stats.snapshot().succeeded, 3);

    let account = backend.request_to("/account").unwrap();
    let cookie = account.header("Cookie").unwrap();
    assert!(cookie.contains("JSESSIONID=LIVE1"), "cookie was {cookie}");
    assert!(!cookie.contains("REC1"));

    let transfer = backend.request_to("/transfer").unwrap();
    let body = transfer.body_text();
    assert!(body.contains("csrf_token=live-token"), "body was {body}");
    assert!(body.contains("amount=5"));
    let cookie = transfer.header("Cookie").unwrap();
    assert!(cookie.contains("JSESSIONID=LIVE1"));
    assert!(cookie.contains("theme=dark"));
}

#[tokio::test]
async fn cookieless_request_adopts_the_only_session() {
    let backend = start_backend(|req| match req.path.as_str() {
        "/login" => MockResponse::ok("").header("Set-Cookie", "JSESSIONID=LIVE9; Path=/"),
        _ => MockResponse::ok("asset"),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![
            entry(
                0,
                request("POST", "/login", json!([])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC9" }])),
            ),
            entry(150, request("GET", "/static/app.js", json!([])), response(200, json!([]))),
        ],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let shutdown = Shutdown::new();
    replay_archive(&config, &archive, stats.clone(), shutdown.subscribe())
        .await
        .unwrap();

    let asset = backend.request_to("/static/app.js").unwrap();
    assert_eq!(asset.header("Cookie"), Some("JSESSIONID=LIVE9"));
    assert_eq!(stats.snapshot().succeeded, 2);
}

#[tokio::test]
async fn session_change_waits_for_the_previous_one() {
    let backend = start_backend(|req| match req.path.as_str() {
        "/login" => MockResponse::ok("")
            .header("Set-Cookie", "JSESSIONID=LIVE1; Path=/")
            .delayed(Duration::from_millis(300)),
        "/rotate" => MockResponse::ok("").header("Set-Cookie", "JSESSIONID=LIVE2; Path=/"),
        _ => MockResponse::ok(""),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![
            entry(
                0,
                request("POST", "/login", json!([])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC1" }])),
            ),
            entry(
                10,
                request("POST", "/rotate", json!([{ "name": "Cookie", "value": "JSESSIONID=REC1" }])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC2" }])),
            ),
            entry(
                500,
                request("GET", "/home", json!([{ "name": "Cookie", "value": "JSESSIONID=REC2" }])),
                response(200, json!([])),
            ),
        ],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let shutdown = Shutdown::new();
    replay_archive(&config, &archive, stats.clone(), shutdown.subscribe())
        .await
        .unwrap();

    let login = backend.request_to("/login").unwrap();
    let rotate = backend.request_to("/rotate").unwrap();
    assert!(
        rotate.received_at.duration_since(login.received_at) >= Duration::from_millis(250),
        "rotate was sent before the login response was applied"
    );
    assert_eq!(rotate.header("Cookie"), Some("JSESSIONID=LIVE1"));

    let home = backend.request_to("/home").unwrap();
    assert_eq!(home.header("Cookie"), Some("JSESSIONID=LIVE2"));
    assert_eq!(stats.snapshot().succeeded, 3);
}

#[tokio::test]
async fn simultaneous_session_changes_keep_recorded_order() {
    let backend = start_backend(|req| match req.path.as_str() {
        "/login" => MockResponse::ok("")
            .header("Set-Cookie", "JSESSIONID=LIVE1; Path=/")
            .delayed(Duration::from_millis(300)),
        "/rotate" => MockResponse::ok("").header("Set-Cookie", "JSESSIONID=LIVE2; Path=/"),
        _ => MockResponse::ok(""),
    })
    .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![
            entry(
                0,
                request("POST", "/login", json!([])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC1" }])),
            ),
            entry(
                0,
                request("POST", "/rotate", json!([{ "name": "Cookie", "value": "JSESSIONID=REC1" }])),
                response(200, json!([{ "name": "Set-Cookie", "value": "JSESSIONID=REC2" }])),
            ),
        ],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let shutdown = Shutdown::new();
    replay_archive(&config, &archive, stats.clone(), shutdown.subscribe())
        .await
        .unwrap();

    let requests = backend.requests();
    let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, ["/login", "/rotate"]);

    let login = &requests[0];
    let rotate = &requests[1];
    assert!(rotate.received_at.duration_since(login.received_at) >= Duration::from_millis(250));
    assert_eq!(rotate.header("Cookie"), Some("JSESSIONID=LIVE1"));
    assert_eq!(stats.snapshot().succeeded, 2);
}

#[tokio::test]
async fn status_mismatch_is_reported_as_failure() {
    let backend = start_backend(|_| MockResponse::ok("boom").status(500)).await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![entry(0, request("GET", "/", json!([])), response(200, json!([])))],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let shutdown = Shutdown::new();
    replay_archive(&config, &archive, stats.clone(), shutdown.subscribe())
        .await
        .unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.failed, 1);
    assert_eq!(snap.succeeded, 0);
    assert_eq!(snap.bytes_read, 4);
}

#[tokio::test]
async fn shutdown_drops_requests_not_yet_due() {
    let backend = start_backend(|_| MockResponse::ok("")).await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    write_har(
        &archive,
        vec![
            entry(0, request("GET", "/now", json!([])), response(200, json!([]))),
            entry(60_000, request("GET", "/later", json!([])), response(200, json!([]))),
        ],
    );

    let config = replay_config(backend.addr, dir.path());
    let stats = Arc::new(ReplayStats::new());
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(());
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        replay_archive(&config, &archive, stats.clone(), rx),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.dropped, 1);
    assert!(backend.request_to("/now").is_some());
    assert!(backend.request_to("/later").is_none());
}

#[tokio::test]
async fn malformed_archive_aborts_the_run() {
    let backend = start_backend(|_| MockResponse::ok("")).await;

    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("traffic.har");
    std::fs::write(&archive, r#"{"log": {"version": "1.1", "entries": []}}"#).unwrap();

    let config = replay_config(backend.addr, dir.path());
    let shutdown = Shutdown::new();
    let err = replay_archive(&config, &archive, Arc::new(ReplayStats::new()), shutdown.subscribe())
        .await
        .unwrap_err();

    assert!(matches!(err, ReplayError::Archive(_)), "unexpected error {err}");
    assert!(backend.requests().is_empty());
}
