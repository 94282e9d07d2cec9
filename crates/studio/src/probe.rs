use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use mcp_studio_core::{ProbeConfig, ProbeStrategy};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-attempt budget for a single connectivity check
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(200);

/// Endpoint whose reachability is polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub strategy: ProbeStrategy,
}

impl ProbeTarget {
    pub fn local(port: u16, strategy: ProbeStrategy) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            strategy,
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.strategy {
            ProbeStrategy::PortOpen => write!(f, "{}:{}", self.host, self.port),
            ProbeStrategy::Http { path } => {
                write!(f, "http://{}:{}{}", self.host, self.port, path)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    TimedOut,
    /// The owner gave up on the start before the target became reachable
    Cancelled,
}

/// Polls a target until it is reachable; individual failures are never fatal
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_ready(
        &self,
        target: &ProbeTarget,
        config: &ProbeConfig,
        cancel: &CancellationToken,
    ) -> ProbeOutcome;
}

/// TCP / HTTP probe polling at a fixed interval
#[derive(Clone, Debug)]
pub struct Prober {
    client: reqwest::Client,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT * 5)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn check(&self, target: &ProbeTarget) -> Result<(), String> {
        match &target.strategy {
            ProbeStrategy::PortOpen => {
                let addr = (target.host.as_str(), target.port);
                match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(addr)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("connect timed out".to_string()),
                }
            }
            ProbeStrategy::Http { .. } => {
                let response = self
                    .client
                    .get(target.to_string())
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                // Anything but 404 means something is serving the port
                if response.status() == reqwest::StatusCode::NOT_FOUND {
                    Err("404 Not Found".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for Prober {
    async fn wait_ready(
        &self,
        target: &ProbeTarget,
        config: &ProbeConfig,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        info!(
            "Polling readiness of {} (timeout {}ms, interval {}ms)",
            target, config.timeout_ms, config.interval_ms
        );

        let poll = ConstantBuilder::default()
            .with_delay(config.interval())
            .without_max_times();
        let attempts = (|| self.check(target))
            .retry(poll)
            .notify(|err: &String, _| debug!(%target, "Not ready yet: {err}"));

        tokio::select! {
            _ = cancel.cancelled() => ProbeOutcome::Cancelled,
            result = tokio::time::timeout(config.timeout(), attempts) => match result {
                Ok(Ok(())) => {
                    info!(%target, "Target is ready");
                    ProbeOutcome::Ready
                }
                // The retry loop is unbounded, so only the timeout ends it
                Ok(Err(_)) | Err(_) => ProbeOutcome::TimedOut,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick() -> ProbeConfig {
        ProbeConfig {
            timeout_ms: 600,
            interval_ms: 50,
            strategy: ProbeStrategy::PortOpen,
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_ready_when_listener_appears_late() {
        let port = free_port();
        let target = ProbeTarget::local(port, ProbeStrategy::PortOpen);
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let outcome = Prober::new()
            .wait_ready(&target, &quick(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProbeOutcome::Ready);
        server.abort();
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_listens() {
        let target = ProbeTarget::local(free_port(), ProbeStrategy::PortOpen);
        let started = std::time::Instant::now();
        let outcome = Prober::new()
            .wait_ready(&target, &quick(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let target = ProbeTarget::local(free_port(), ProbeStrategy::PortOpen);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let config = ProbeConfig {
            timeout_ms: 10_000,
            ..quick()
        };
        let started = std::time::Instant::now();
        let outcome = Prober::new().wait_ready(&target, &config, &cancel).await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_target_display() {
        let target = ProbeTarget::local(
            4000,
            ProbeStrategy::Http {
                path: "/health".into(),
            },
        );
        assert_eq!(target.to_string(), "http://127.0.0.1:4000/health");
        assert_eq!(
            ProbeTarget::local(4000, ProbeStrategy::PortOpen).to_string(),
            "127.0.0.1:4000"
        );
    }
}
