//! Cancellable polling with a fixed interval and a hard deadline.
//!
//! Every blocking wait in a build (operation completion, instance boot, the
//! credential handshake, WinRM port readiness) goes through [`poll_until`] so a
//! single [`CancellationToken`] shared across the build can abort whichever
//! phase is currently stuck.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Interval and deadline for a polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSchedule {
    /// Delay between consecutive probes.
    pub interval: Duration,
    /// Total time allowed before the wait gives up.
    pub timeout: Duration,
}

impl PollSchedule {
    /// Creates a schedule from an interval and a timeout.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Reasons a polling loop stopped without producing a value.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum WaitError<E> {
    /// The deadline elapsed before the probe reported completion.
    #[error("timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The shared cancellation token fired.
    #[error("wait cancelled")]
    Cancelled,
    /// The probe itself failed; polling stops immediately.
    #[error(transparent)]
    Probe(E),
}

/// Repeatedly runs `probe` until it yields `Some`, fails, the deadline passes,
/// or `cancel` fires.
///
/// The probe always runs at least once, even with a zero timeout. The deadline
/// is checked after each probe, so a probe that succeeds on its last allowed
/// attempt still wins.
///
/// # Errors
///
/// Returns [`WaitError::TimedOut`] when the schedule's timeout elapses,
/// [`WaitError::Cancelled`] when the token is cancelled, or
/// [`WaitError::Probe`] with the first probe failure.
pub async fn poll_until<T, E, F, Fut>(
    cancel: &CancellationToken,
    schedule: PollSchedule,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + schedule.timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            result = probe() => result,
        };
        if let Some(value) = outcome.map_err(WaitError::Probe)? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut {
                timeout: schedule.timeout,
            });
        }

        let pause = schedule.interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            () = sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn schedule() -> PollSchedule {
        PollSchedule::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_probe_completes() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, WaitError<()>> =
            poll_until(&CancellationToken::new(), schedule(), || {
                let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok((seen == 3).then_some(seen)) }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_probe_never_completes() {
        let started = Instant::now();
        let result: Result<(), WaitError<()>> =
            poll_until(&CancellationToken::new(), schedule(), || async { Ok(None) }).await;

        assert_eq!(
            result,
            Err(WaitError::TimedOut {
                timeout: Duration::from_secs(10)
            })
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_error_stops_polling() {
        let result: Result<(), WaitError<&str>> =
            poll_until(&CancellationToken::new(), schedule(), || async {
                Err("boom")
            })
            .await;

        assert_eq!(result, Err(WaitError::Probe("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result: Result<(), WaitError<()>> =
            poll_until(&cancel, schedule(), || async { Ok(None) }).await;

        assert_eq!(result, Err(WaitError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_token_skips_probe() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), WaitError<()>> = poll_until(&cancel, schedule(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await;

        assert_eq!(result, Err(WaitError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
