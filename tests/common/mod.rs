//! Common test utilities for integration tests.

pub mod fixtures;

use std::net::TcpListener;

pub use fixtures::*;

/// Find an available port for testing.
pub fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to port");
    listener.local_addr().unwrap().port()
}

/// Wait for a server to be ready by polling its health endpoint.
///
/// Any HTTP answer counts, an unhealthy model set still means the server is up.
pub async fn wait_for_server(addr: &str, timeout_secs: u64) -> bool {
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}

/// Asserts that two fractions agree to within 1e-9.
pub fn assert_fraction(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected fraction {}, got {}",
        expected,
        actual
    );
}
