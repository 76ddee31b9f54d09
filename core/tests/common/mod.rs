//! Starts the mock server on a random port for the integration suites.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use coze_core::ClientConfig;
use mock_server::AppState;

/// Run the server on a background thread with its own runtime, for tests
/// that drive the blocking client from the test thread.
pub fn start_blocking(state: AppState) -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_state(listener, state).await
        })
        .unwrap();
    });

    format!("http://{addr}")
}

/// Run the server as a task on the test's own runtime.
pub async fn start_async(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::run_with_state(listener, state));
    format!("http://{addr}")
}

pub fn config(base_url: &str) -> ClientConfig {
    ClientConfig::new(base_url).timeout(Duration::from_secs(10))
}

/// Poll `condition` until it holds or `limit` passes.
pub fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
