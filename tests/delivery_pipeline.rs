//! End-to-end delivery through the public supervisor surface.

mod common;

use common::FakeTransport;
use revi_sdk::{
    Config, ErrorCapture, InstantSleeper, ManualClock, MemoryBackend, Runtime, SdkError,
    Supervisor,
};
use std::sync::Arc;

fn runtime(transport: Arc<FakeTransport>, clock: ManualClock) -> Runtime {
    let mut config = Config::new("test-key", "https://ingest.example");
    config.retry.jitter_ratio = 0.0;
    Runtime::new(config, transport)
        .with_clock(Arc::new(clock))
        .with_sleeper(Arc::new(InstantSleeper))
        .with_backend(Arc::new(MemoryBackend::new()))
        .manual_drive()
}

#[tokio::test]
async fn three_errors_leave_in_one_batch() {
    let clock = ManualClock::new();
    let transport = Arc::new(FakeTransport::new(clock.clone()));
    let sdk = Supervisor::start(runtime(transport.clone(), clock)).await.expect("start");

    for message in ["first", "second", "third"] {
        sdk.capture_error(ErrorCapture::new(message)).await.expect("queued");
    }
    assert_eq!(sdk.queue_size().0, 3);

    let drained = sdk.flush(None).await;
    assert!(drained);
    assert_eq!(sdk.queue_size(), (0, 0));

    let posts = transport.posts();
    assert_eq!(posts.len(), 1, "three small errors travel together");
    assert_eq!(posts[0].item_count(), 3);
    let messages: Vec<&str> = posts[0].body["errors"]
        .as_array()
        .expect("errors array")
        .iter()
        .map(|e| e["message"].as_str().expect("message"))
        .collect();
    assert_eq!(messages, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn flaky_server_recovers_with_one_retry() {
    let clock = ManualClock::new();
    let transport = Arc::new(FakeTransport::new(clock.clone()));
    let sdk = Supervisor::start(runtime(transport.clone(), clock)).await.expect("start");

    sdk.capture_error(ErrorCapture::new("flaky")).await.expect("queued");
    transport.push_result(Err(SdkError::Server { status: 503 }));
    // The scripted queue then falls back to accepting.

    let drained = sdk.flush(None).await;
    assert!(drained);
    assert_eq!(sdk.queue_size(), (0, 0));
    assert_eq!(transport.posts().len(), 2, "first attempt plus one retry");

    let stats = sdk.retry_stats("primary:error");
    assert_eq!(stats.successful_retries, 1);
    assert_eq!(stats.failed_retries, 0);
}

#[tokio::test]
async fn terminal_rejection_drops_items_instead_of_looping() {
    let clock = ManualClock::new();
    let transport = Arc::new(FakeTransport::new(clock.clone()));
    let sdk = Supervisor::start(runtime(transport.clone(), clock)).await.expect("start");

    sdk.capture_error(ErrorCapture::new("rejected")).await.expect("queued");
    transport.push_result(Err(SdkError::Client { status: 422 }));

    // The run reports failure, but the poisonous item is gone.
    sdk.flush(None).await;
    assert_eq!(sdk.queue_size(), (0, 0));
    assert_eq!(transport.posts().len(), 1, "no retry for a terminal status");
}
