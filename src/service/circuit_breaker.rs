//! Circuit breaker for the insight service.
//!
//! One instance is shared by every worker. State changes happen under a short
//! synchronous lock that is never held across an `.await`.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::BreakerSettings;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Cool-down elapsed and a single probe call is in flight
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

enum Admission {
    Normal,
    Probe,
}

pub struct CircuitBreaker {
    service: &'static str,
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: &'static str, settings: BreakerSettings) -> Self {
        Self {
            service,
            max_failures: settings.max_failures.max(1),
            reset_timeout: settings.reset_timeout,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Run `f` unless the breaker is open.
    ///
    /// An open breaker returns [`AppError::ServiceUnavailable`] without calling
    /// `f`; a failing `f` becomes [`AppError::DownstreamFailure`].
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let admission = self.admit()?;
        let mut probe = ProbeGuard {
            breaker: self,
            armed: matches!(admission, Admission::Probe),
        };

        match f().await {
            Ok(value) => {
                probe.armed = false;
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                let was_probe = probe.armed;
                probe.armed = false;
                self.on_failure(was_probe);
                Err(AppError::downstream(self.service, format!("{:#}", e)))
            }
        }
    }

    pub fn state(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let state = match (inner.opened_at, inner.probe_in_flight) {
            (None, _) => BreakerState::Closed,
            (Some(_), true) => BreakerState::HalfOpen,
            (Some(_), false) => BreakerState::Open,
        };
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        let Some(opened_at) = inner.opened_at else {
            return Ok(Admission::Normal);
        };

        let elapsed = opened_at.elapsed();
        if elapsed <= self.reset_timeout {
            return Err(AppError::ServiceUnavailable {
                service: self.service,
                retry_in: self.reset_timeout - elapsed,
            });
        }
        if inner.probe_in_flight {
            return Err(AppError::ServiceUnavailable {
                service: self.service,
                retry_in: Duration::ZERO,
            });
        }

        log::info!("[BREAKER] {} cool-down over, letting one probe through", self.service);
        inner.probe_in_flight = true;
        inner.consecutive_failures = 0;
        Ok(Admission::Probe)
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.opened_at.is_some() {
            log::info!("[BREAKER] {} recovered, closing", self.service);
        }
        *inner = Inner::default();
    }

    fn on_failure(&self, was_probe: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        if was_probe {
            log::warn!("[BREAKER] {} probe failed, re-opening", self.service);
            inner.probe_in_flight = false;
            inner.opened_at = Some(Instant::now());
        } else if inner.opened_at.is_none() && inner.consecutive_failures >= self.max_failures {
            log::warn!(
                "[BREAKER] {} opened after {} consecutive failures",
                self.service,
                inner.consecutive_failures
            );
            inner.opened_at = Some(Instant::now());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Counts a probe that never finished (its future was dropped) as failed, so
/// the breaker cannot stay half-open forever.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(max_failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerSettings {
                max_failures,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<()> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("boom"))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicUsize) -> Result<&'static str> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("ok")
        })
        .await
    }

    #[tokio::test]
    async fn test_closed_breaker_passes_calls_through() {
        let b = breaker(3, 1_000);
        let calls = AtomicUsize::new(0);
        assert_eq!(succeed(&b, &calls).await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.state().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_max_failures_and_fails_fast() {
        let b = breaker(3, 60_000);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let err = fail(&b, &calls).await.unwrap_err();
            assert!(matches!(err, AppError::DownstreamFailure { .. }));
        }
        assert_eq!(b.state().state, BreakerState::Open);

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(err.is_service_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open breaker must not invoke f");
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 60_000);
        let calls = AtomicUsize::new(0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.state().consecutive_failures, 0);

        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_exactly_one_probe_after_reset_timeout() {
        let b = Arc::new(breaker(1, 50));
        let calls = Arc::new(AtomicUsize::new(0));
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state().state, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };

        // Let the probe get admitted
        while b.state().state != BreakerState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let err = succeed(&b, &calls).await.unwrap_err();
        assert!(err.is_service_unavailable(), "only the probe may pass");

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.state().state, BreakerState::Closed);
        succeed(&b, &calls).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let b = breaker(2, 40);
        let calls = AtomicUsize::new(0);
        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(b.state().state, BreakerState::Open);

        // Fresh cool-down
        assert!(succeed(&b, &calls).await.unwrap_err().is_service_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_probe_counts_as_failure() {
        let b = Arc::new(breaker(1, 30));
        let calls = AtomicUsize::new(0);
        fail(&b, &calls).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hung = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| std::future::pending::<anyhow::Result<()>>()).await
            })
        };
        while b.state().state != BreakerState::HalfOpen {
            tokio::task::yield_now().await;
        }
        hung.abort();
        let _ = hung.await;

        assert_eq!(b.state().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let b = Arc::new(breaker(3, 60_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let b = b.clone();
                let calls = calls.clone();
                tokio::spawn(async move { fail(&b, &calls).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap_err();
        }

        let snapshot = b.state();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.consecutive_failures >= 3);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }
}
