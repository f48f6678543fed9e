//! Phased retry protocol with cancellable waits.
//!
//! The state machine is: a bounded attempt phase with exponential backoff,
//! one long cooldown, a second bounded attempt phase, then terminal failure.
//! Non-retryable failures and user interrupts exit immediately from any
//! state. Counts and durations come from `RetryConfig`; the mechanism is
//! fixed.

use crate::config::RetryConfig;
use crate::error::{CompletionError, ErrorKind};
use crate::logging;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Cooldown waits are delivered in slices no coarser than this, so an
/// interrupt lands with bounded latency.
pub const WAIT_SLICE_SECS: u64 = 10;

/// Per-request cancellation token. Allocated fresh for every attempt, after
/// the interrupt flag has been checked, and cancelled by `abort`.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // re-check between registering and awaiting: notify_waiters only
            // wakes already-registered waiters
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Retry progress for one in-flight call. Never shared across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub extended_phase_used: bool,
}

/// What follows a retryable failure of the current attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait, then run the next attempt in the current phase
    Backoff(Duration),
    /// Current phase exhausted; cooldown, then restart attempts once
    Cooldown,
    /// Both phases spent
    GiveUp,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            extended_phase_used: false,
        }
    }

    pub fn next_step(&mut self, policy: &RetryConfig) -> RetryStep {
        if self.attempt < policy.max_attempts {
            let delay = policy.base_delay_ms * (1u64 << (self.attempt - 1));
            self.attempt += 1;
            RetryStep::Backoff(Duration::from_millis(delay))
        } else if !self.extended_phase_used {
            self.extended_phase_used = true;
            self.attempt = 1;
            RetryStep::Cooldown
        } else {
            RetryStep::GiveUp
        }
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback reporting remaining cooldown seconds before each slice
pub type ProgressFn = dyn Fn(u64) + Send + Sync;

/// Drive `op` through the full retry protocol.
///
/// `op` receives a fresh `CancelToken` per attempt. The interrupt flag is
/// checked before each token is allocated: an abort issued a moment earlier
/// must not be silently discarded by the next attempt's new token.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryConfig,
    interrupt: &AtomicBool,
    active: &Mutex<Option<CancelToken>>,
    cooldown_progress: Option<&ProgressFn>,
    mut op: F,
) -> Result<T, CompletionError>
where
    F: FnMut(CancelToken) -> Fut,
    Fut: Future<Output = Result<T, CompletionError>>,
{
    let mut state = RetryState::new();

    loop {
        if interrupt.load(Ordering::SeqCst) {
            return Err(CompletionError::UserInterrupted);
        }

        let cancel = CancelToken::new();
        *active.lock().unwrap() = Some(cancel.clone());

        let timeout = Duration::from_secs(policy.request_timeout_secs);
        let attempt_result = tokio::time::timeout(timeout, op(cancel.clone())).await;

        active.lock().unwrap().take();

        let err = match attempt_result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => CompletionError::Timeout(format!(
                "no response within {}s",
                policy.request_timeout_secs
            )),
        };

        if err.kind() == ErrorKind::UserInterrupted
            || cancel.is_cancelled()
            || interrupt.load(Ordering::SeqCst)
        {
            return Err(CompletionError::UserInterrupted);
        }
        if !err.retryable() {
            return Err(err);
        }

        match state.next_step(policy) {
            RetryStep::Backoff(delay) => {
                logging::warn(&format!(
                    "Transient failure (attempt {}): {}; retrying in {:?}",
                    state.attempt - 1,
                    err,
                    delay
                ));
                wait_interruptible(delay, interrupt).await?;
            }
            RetryStep::Cooldown => {
                logging::warn(&format!(
                    "Attempts exhausted ({}); entering {}s cooldown before final phase",
                    err, policy.cooldown_secs
                ));
                cooldown_wait(policy.cooldown_secs, interrupt, cooldown_progress).await?;
            }
            RetryStep::GiveUp => {
                logging::error(&format!("Retry protocol exhausted: {}", err));
                return Err(CompletionError::retry_exhausted(err));
            }
        }
    }
}

/// Sleep in slices, checking the interrupt flag at each slice boundary
async fn wait_interruptible(delay: Duration, interrupt: &AtomicBool) -> Result<(), CompletionError> {
    let mut remaining = delay;
    let slice = Duration::from_secs(WAIT_SLICE_SECS);

    while !remaining.is_zero() {
        if interrupt.load(Ordering::SeqCst) {
            return Err(CompletionError::UserInterrupted);
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining -= step;
    }

    if interrupt.load(Ordering::SeqCst) {
        return Err(CompletionError::UserInterrupted);
    }
    Ok(())
}

/// The long wait between attempt phases, reporting remaining seconds before
/// each slice
async fn cooldown_wait(
    cooldown_secs: u64,
    interrupt: &AtomicBool,
    progress: Option<&ProgressFn>,
) -> Result<(), CompletionError> {
    let mut remaining = cooldown_secs;

    while remaining > 0 {
        if interrupt.load(Ordering::SeqCst) {
            return Err(CompletionError::UserInterrupted);
        }
        if let Some(progress) = progress {
            progress(remaining);
        }
        let slice = remaining.min(WAIT_SLICE_SECS);
        tokio::time::sleep(Duration::from_secs(slice)).await;
        remaining -= slice;
    }

    if interrupt.load(Ordering::SeqCst) {
        return Err(CompletionError::UserInterrupted);
    }
    Ok(())
}
