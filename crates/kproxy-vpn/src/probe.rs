//! Reachability and Throughput Probes

use crate::manager::ConnectionError;
use kproxy_net::ProxyClient;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shortest duration used in the speed formula
const MIN_DURATION: Duration = Duration::from_millis(1);

/// Result of one download measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub bytes_transferred: u64,
    pub duration_seconds: f64,
    /// Megabits per second: bytes * 8 / 1e6 / seconds
    pub speed_mbps: f64,
}

impl SpeedTestResult {
    pub fn new(bytes_transferred: u64, elapsed: Duration) -> Self {
        let duration_seconds = elapsed.max(MIN_DURATION).as_secs_f64();
        Self {
            bytes_transferred,
            duration_seconds,
            speed_mbps: bytes_transferred as f64 * 8.0 / 1_000_000.0 / duration_seconds,
        }
    }
}

impl fmt::Display for SpeedTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} Mb/s ({} bytes in {:.2}s)",
            self.speed_mbps, self.bytes_transferred, self.duration_seconds
        )
    }
}

#[derive(Deserialize)]
struct IpResponse {
    ip: String,
}

/// Extract the address from an IP-check body (`{"ip":"..."}` or plain text)
pub fn parse_ip(body: &str) -> Option<IpAddr> {
    match serde_json::from_str::<IpResponse>(body) {
        Ok(response) => response.ip.trim().parse().ok(),
        Err(_) => body.trim().parse().ok(),
    }
}

/// GET `url` through the proxy and return the body on 2xx
pub async fn check_reachability(client: &ProxyClient, url: &str) -> Result<String, ConnectionError> {
    let response = client.get(url).await?;
    if !response.is_success() {
        return Err(ConnectionError::Reachability(response.status.as_u16()));
    }

    debug!(
        "Reachability check ok (first byte {:?}, total {:?})",
        response.ttfb, response.total_time
    );
    Ok(String::from_utf8_lossy(&response.body).into_owned())
}

/// Download `url` through the proxy and time it
///
/// The body is discarded as it streams in.
pub async fn measure_speed(client: &ProxyClient, url: &str) -> Result<SpeedTestResult, ConnectionError> {
    let start = Instant::now();
    let mut stream = client
        .get_streaming(url)
        .await
        .map_err(|e| ConnectionError::SpeedTest(e.to_string()))?;

    if !stream.status().is_success() {
        return Err(ConnectionError::SpeedTest(format!("server returned {}", stream.status())));
    }

    let mut bytes = 0u64;
    while let Some(chunk) = stream
        .next_chunk()
        .await
        .map_err(|e| ConnectionError::SpeedTest(e.to_string()))?
    {
        bytes += chunk.len() as u64;
    }

    let result = SpeedTestResult::new(bytes, start.elapsed());
    debug!("Speed test: {}", result);
    Ok(result)
}
