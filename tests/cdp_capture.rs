//! Chrome-backed capture tests (require Chrome; run with `--features cdp -- --ignored`)

#![cfg(feature = "cdp")]

use refhub::{
    CaptureConfig, CaptureWorker, ItemStatus, NewReference, ReferenceStore, Viewport,
    WorkerOptions,
};
use std::sync::{Arc, Once};
use tiny_http::{Response, Server};

static INIT: Once = Once::new();

/// Start a simple test HTTP server
fn start_test_server() -> String {
    INIT.call_once(|| {
        std::thread::spawn(|| {
            let server = Server::http("127.0.0.1:18090").unwrap();
            for request in server.incoming_requests() {
                let response = match request.url() {
                    "/look" => Response::from_string(
                        r#"<!DOCTYPE html>
<html>
<head><title>Lookbook</title></head>
<body style="margin:0">
<div style="height:3000px;background:linear-gradient(#222,#eee)">Look 01</div>
</body>
</html>"#,
                    )
                    .with_header(
                        "Content-Type: text/html; charset=utf-8"
                            .parse::<tiny_http::Header>()
                            .unwrap(),
                    ),
                    _ => Response::from_string("Not Found").with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    "http://127.0.0.1:18090".to_string()
}

#[tokio::test]
#[ignore] // Requires Chrome to be installed
async fn test_full_page_capture() {
    let base = start_test_server();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ReferenceStore::in_memory().unwrap());
    let look = format!("{}/look", base);
    store
        .enqueue(&[NewReference::new("apc", "2026 SS", "tee", look.clone())])
        .unwrap();

    let engine = refhub::new_renderer().expect("Failed to create renderer");
    let worker = CaptureWorker::new(
        Arc::clone(&store),
        engine,
        CaptureConfig {
            viewport: Viewport {
                width: 800,
                height: 600,
            },
            ..Default::default()
        },
        dir.path().to_path_buf(),
        WorkerOptions {
            concurrency: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let report = worker.run_batch().await.unwrap();
    assert_eq!(report.succeeded, 1, "{:?}", report);

    assert!(store.select_failed(10).unwrap().is_empty());
    let captured = store.list(&Default::default()).unwrap().remove(0);
    assert_eq!(captured.status, ItemStatus::Success);

    let bytes = std::fs::read(&captured.image_path).unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8], "not a JPEG");
}

#[tokio::test]
#[ignore] // Requires Chrome to be installed
async fn test_unreachable_url_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ReferenceStore::in_memory().unwrap());
    store
        .enqueue(&[NewReference::new("apc", "fw25", "tee", "http://127.0.0.1:1/")])
        .unwrap();

    let worker = CaptureWorker::new(
        Arc::clone(&store),
        refhub::new_renderer().unwrap(),
        CaptureConfig {
            max_retries: 0,
            timeout_ms: 5000,
            ..Default::default()
        },
        dir.path().to_path_buf(),
        WorkerOptions {
            concurrency: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let report = worker.run_batch().await.unwrap();
    assert_eq!(report.failed, 1);
    let failed = store.select_failed(10).unwrap();
    assert!(!failed[0].error_message.is_empty());
}
