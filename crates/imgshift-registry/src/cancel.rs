use crate::copier::Sleeper;
use crate::RegistryError;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Cancellation flag with an optional deadline, shared across threads.
///
/// Waits block on a condition variable so that [`CancelToken::cancel`] wakes
/// a sleeping retry loop at once.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    wake: Condvar,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                ..Inner::default()
            }),
        }
    }

    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn deadline_passed(&self, at: Instant) -> bool {
        self.inner.deadline.is_some_and(|deadline| at >= deadline)
    }
}

impl Sleeper for CancelToken {
    fn check(&self) -> Result<(), RegistryError> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled("cancellation requested".to_owned()));
        }
        if self.deadline_passed(Instant::now()) {
            return Err(RegistryError::Cancelled("deadline exceeded".to_owned()));
        }
        Ok(())
    }

    fn sleep(&self, duration: Duration) -> Result<(), RegistryError> {
        // `None` is a wait too long to represent, bounded only by cancellation.
        let wake_at = Instant::now().checked_add(duration);
        let past_deadline = match wake_at {
            Some(at) => self.deadline_passed(at),
            None => self.inner.deadline.is_some(),
        };
        if past_deadline {
            return Err(RegistryError::Cancelled(format!(
                "deadline exceeded before retry in {}s",
                duration.as_secs()
            )));
        }
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(RegistryError::Cancelled("cancellation requested".to_owned()));
            }
            cancelled = match wake_at {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Ok(());
                    }
                    self.inner
                        .wake
                        .wait_timeout(cancelled, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .wake
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}
