//! Circuit breakers for peer shipping.
//!
//! A peer that keeps failing is not hammered: after `failure_threshold`
//! consecutive failed ships the peer's circuit opens and ship attempts fail
//! fast until `recovery_timeout` has elapsed. Uses the `recloser` crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, ships pass through
//! - **Open**: Peer unhealthy, ships rejected without touching the transport
//! - **HalfOpen**: Probing whether the peer recovered
//!
//! A rejected ship is handled like any other ship failure: the worker backs
//! off and retries the same batch. Nothing is dropped.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use cluster_replication::circuit_breaker::{CircuitError, PeerCircuits};
//! # use cluster_replication::circuit_breaker::CircuitConfig;
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuits = PeerCircuits::new(CircuitConfig::default());
//! let circuit = circuits.for_peer("2");
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* shipped */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, backoff */ }
//!     Err(CircuitError::Inner(e)) => { /* transport error, backoff */ }
//! }
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Successful probes in half-open needed to close it again.
    pub success_threshold: u32,
    /// How long to stay open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(10),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // A full window of failures is the only rate above 0.99, so the
        // circuit trips on `failure_threshold` consecutive failures
        let recloser = Recloser::custom()
            .error_rate(0.99)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure so that nothing runs when the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_rejection(&self.name);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// One circuit per peer id, created on first use.
pub struct PeerCircuits {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
}

impl PeerCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// The circuit for `peer_id`. Recovered and local queues of the same
    /// peer share it: they all ship to the same endpoint.
    pub fn for_peer(&self, peer_id: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("peer_{}", peer_id),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Forget a removed peer's circuit, so a re-added peer starts closed.
    pub fn remove(&self, peer_id: &str) {
        self.circuits.remove(peer_id);
    }

    /// Peers whose circuit currently looks open.
    pub fn open_peers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuits
            .iter()
            .filter(|c| c.value().is_likely_open())
            .map(|c| c.key().clone())
            .collect();
        open.sort();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", test_config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", test_config());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );

        for _ in 0..5 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }

        assert!(cb.rejections() >= 1);
        assert!(cb.is_likely_open());
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_run_operation() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 1,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );
        let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_rejected());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_recovers_after_timeout() {
        let cb = CircuitBreaker::new("test", test_config());
        for _ in 0..4 {
            let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_peer_circuits_are_shared_per_peer() {
        let circuits = PeerCircuits::new(test_config());
        let a = circuits.for_peer("2");
        let b = circuits.for_peer("2");
        let c = circuits.for_peer("3");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.name(), "peer_2");

        circuits.remove("2");
        assert!(!Arc::ptr_eq(&a, &circuits.for_peer("2")));
        assert!(circuits.open_peers().is_empty());
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert!(rejected.is_rejected());
        assert!(rejected.inner().is_none());

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(!inner.is_rejected());
        assert_eq!(inner.inner(), Some(&"boom"));
    }
}
