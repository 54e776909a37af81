//! HTTP health probing.
//!
//! [`HealthProber::probe`] is a single stateless GET. [`ProbePool`] runs probes
//! on the tokio runtime, at most `workers` at a time, and hands every result
//! back to the supervisor through one crossbeam channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::debug;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Allowance for connection teardown on top of the probe timeout.
const TEARDOWN_SLACK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx within the timeout.
    Healthy,
    /// Any other HTTP status.
    Unhealthy(u16),
    /// Transport, DNS, or timeout failure.
    Unreachable(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => f.write_str("healthy"),
            ProbeOutcome::Unhealthy(code) => write!(f, "unhealthy (HTTP {code})"),
            ProbeOutcome::Unreachable(reason) => write!(f, "unreachable ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Health endpoints are local; proxy env vars must not reroute them.
        let client = reqwest::Client::builder()
            .no_proxy()
            .user_agent(concat!("devsup/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Issue one GET against `url`. Never retries and never waits much longer
    /// than `timeout`.
    pub async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let request = self.client.get(url).timeout(timeout).send();
        match tokio::time::timeout(timeout + TEARDOWN_SLACK, request).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    ProbeOutcome::Healthy
                } else {
                    ProbeOutcome::Unhealthy(status.as_u16())
                }
            }
            Ok(Err(e)) => ProbeOutcome::Unreachable(describe(&e)),
            Err(_) => ProbeOutcome::Unreachable(format!("timed out after {timeout:?}")),
        }
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        return "timed out".to_string();
    }
    // reqwest's top-level message hides the interesting part in the chain.
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

/// Result of one dispatched probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: String,
    /// Dispatch sequence, used by the supervisor to discard stale results.
    pub seq: u64,
    pub outcome: ProbeOutcome,
}

/// Bounded probe workers feeding a single-consumer queue.
pub struct ProbePool {
    runtime: Handle,
    prober: HealthProber,
    permits: Arc<Semaphore>,
    tx: Sender<ProbeResult>,
}

impl ProbePool {
    pub fn new(
        runtime: Handle,
        workers: usize,
    ) -> Result<(Self, Receiver<ProbeResult>), reqwest::Error> {
        let (tx, rx) = unbounded();
        let pool = Self {
            runtime,
            prober: HealthProber::new()?,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            tx,
        };
        Ok((pool, rx))
    }

    pub fn dispatch(&self, name: String, seq: u64, url: String, timeout: Duration) {
        let prober = self.prober.clone();
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = prober.probe(&url, timeout).await;
            debug!("probe {name}#{seq} {url} → {outcome}");
            // Receiver gone means the supervisor is exiting.
            let _ = tx.send(ProbeResult { name, seq, outcome });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::time::Instant;

    async fn serve() -> SocketAddr {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/broken", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn two_hundred_is_healthy() {
        let addr = serve().await;
        let prober = HealthProber::new().unwrap();
        let outcome = prober
            .probe(&format!("http://{addr}/health"), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
    }

    #[tokio::test]
    async fn other_status_is_unhealthy() {
        let addr = serve().await;
        let prober = HealthProber::new().unwrap();
        let broken = prober
            .probe(&format!("http://{addr}/broken"), Duration::from_secs(2))
            .await;
        assert_eq!(broken, ProbeOutcome::Unhealthy(503));
        let missing = prober
            .probe(&format!("http://{addr}/nope"), Duration::from_secs(2))
            .await;
        assert_eq!(missing, ProbeOutcome::Unhealthy(404));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let prober = HealthProber::new().unwrap();
        let outcome = prober
            .probe(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(2))
            .await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable(_)), "{outcome}");
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_within_bound() {
        let addr = serve().await;
        let prober = HealthProber::new().unwrap();
        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        let outcome = prober.probe(&format!("http://{addr}/slow"), timeout).await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable(_)));
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
    }

    #[test]
    fn pool_delivers_results_with_sequence() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let addr = rt.block_on(serve());
        let (pool, rx) = ProbePool::new(rt.handle().clone(), 2).unwrap();

        pool.dispatch(
            "api".into(),
            7,
            format!("http://{addr}/health"),
            Duration::from_secs(2),
        );
        pool.dispatch(
            "web".into(),
            8,
            format!("http://{addr}/broken"),
            Duration::from_secs(2),
        );

        let mut results: Vec<ProbeResult> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort_by_key(|r| r.seq);
        assert_eq!(results[0].name, "api");
        assert_eq!(results[0].outcome, ProbeOutcome::Healthy);
        assert_eq!(results[1].name, "web");
        assert_eq!(results[1].outcome, ProbeOutcome::Unhealthy(503));
    }
}
