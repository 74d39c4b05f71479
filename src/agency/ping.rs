//! Connection probing over gRPC
//!
//! The consul check uses this to tell live instances from stale
//! registrations. The probe dials like a blocking gRPC client with a
//! deadline: connection attempts are retried until the deadline, so a dead
//! target surfaces as a timeout, while a probe that cannot run at all (for
//! example an unparseable address) is a distinct failure.

use std::time::Duration;
use tonic::transport::Endpoint;

/// Outcome of one connection probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    /// The target accepted a connection before the deadline
    Reachable,
    /// No connection could be established before the deadline; for a
    /// registry entry this is the stale-registration signal
    Timeout,
    /// The probe itself could not run
    Failed(String),
}

/// Connection probe the registry check depends on.
#[async_trait::async_trait]
pub trait PingAgency: Send + Sync {
    /// Probe the target address with a per-probe deadline.
    async fn ping(&self, target: &str, timeout: Duration) -> PingOutcome;
}

/// Probe implementation dialing a gRPC channel.
#[derive(Debug, Default)]
pub struct GrpcPingAgency;

impl GrpcPingAgency {
    /// Create a new probe agency.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl PingAgency for GrpcPingAgency {
    async fn ping(&self, target: &str, timeout: Duration) -> PingOutcome {
        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{}", target)
        };

        let endpoint = match Endpoint::from_shared(uri) {
            Ok(endpoint) => endpoint.connect_timeout(timeout),
            Err(e) => return PingOutcome::Failed(format!("invalid ping target {}: {}", target, e)),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return PingOutcome::Timeout;
            }
            match tokio::time::timeout(remaining, endpoint.connect()).await {
                Ok(Ok(_channel)) => return PingOutcome::Reachable,
                // Dial errors (refused, unreachable) are retried until the
                // deadline; a dead target classifies as Timeout.
                Ok(Err(_)) => {
                    tokio::time::sleep(Duration::from_millis(100).min(remaining)).await;
                }
                Err(_) => return PingOutcome::Timeout,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unparseable_target_fails_without_dialing() {
        let agency = GrpcPingAgency::new();
        let outcome = agency.ping("not a valid address", Duration::from_secs(1)).await;
        assert!(matches!(outcome, PingOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_refused_target_classifies_as_timeout() {
        // Bind a port, then drop the listener so dialing it is refused.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agency = GrpcPingAgency::new();
        let outcome = agency
            .ping(&addr.to_string(), Duration::from_millis(500))
            .await;
        assert_eq!(outcome, PingOutcome::Timeout);
    }
}
