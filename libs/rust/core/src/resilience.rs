//! Bounded polling with a fixed backoff.
//!
//! Used where a reader may observe a writer mid-update and should look again
//! shortly instead of failing. Polling stops at `timeout`, never loops forever.

use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}
impl Default for PollConfig { fn default() -> Self { Self { interval: Duration::from_millis(10), timeout: Duration::from_secs(5) } } }

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut { attempts: usize, waited: Duration },
}

/// Calls `op` until it yields `Some`, an error, or the timeout elapses.
/// `op` receives the zero-based attempt number.
pub fn poll_blocking<F, T, E>(cfg: &PollConfig, mut op: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut(usize) -> Result<Option<T>, E>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        if let Some(v) = op(attempt)? { return Ok(PollOutcome::Ready(v)); }
        attempt += 1;
        let waited = started.elapsed();
        if waited >= cfg.timeout { return Ok(PollOutcome::TimedOut { attempts: attempt, waited }); }
        std::thread::sleep(cfg.interval.min(cfg.timeout - waited));
    }
}

/// Async form of [`poll_blocking`]; sleeps on the tokio timer.
pub async fn poll_async<F, Fut, T, E>(cfg: &PollConfig, mut op: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        if let Some(v) = op(attempt).await? { return Ok(PollOutcome::Ready(v)); }
        attempt += 1;
        let waited = started.elapsed();
        if waited >= cfg.timeout { return Ok(PollOutcome::TimedOut { attempts: attempt, waited }); }
        tokio::time::sleep(cfg.interval.min(cfg.timeout - waited)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> PollConfig { PollConfig { interval: Duration::from_millis(1), timeout: Duration::from_millis(50) } }

    #[test]
    fn blocking_eventual_success() {
        let res: Result<_, &str> = poll_blocking(&fast(), |i| Ok(if i < 3 { None } else { Some(i) }));
        assert_eq!(res.unwrap(), PollOutcome::Ready(3));
    }

    #[test]
    fn blocking_times_out() {
        let res: Result<PollOutcome<()>, &str> = poll_blocking(&fast(), |_| Ok(None));
        match res.unwrap() {
            PollOutcome::TimedOut { attempts, waited } => { assert!(attempts > 1); assert!(waited >= Duration::from_millis(50)); }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blocking_error_stops_polling() {
        let mut calls = 0;
        let res: Result<PollOutcome<()>, &str> = poll_blocking(&fast(), |_| { calls += 1; Err("boom") });
        assert_eq!(res.unwrap_err(), "boom");
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn async_eventual_success() {
        let res: Result<_, &str> = poll_async(&fast(), |i| async move { Ok(if i < 2 { None } else { Some("ok") }) }).await;
        assert_eq!(res.unwrap(), PollOutcome::Ready("ok"));
    }
}
