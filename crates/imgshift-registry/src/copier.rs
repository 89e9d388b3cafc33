use crate::context::RegistryContext;
use crate::locator::Locator;
use crate::transfer::{PolicyContext, Transfer, TrustPolicy};
use crate::RegistryError;
use std::time::Duration;
use tracing::{debug, warn};

/// Waits between copy attempts.
pub trait Sleeper: Send + Sync {
    /// Fail fast before an attempt when the wait has been abandoned.
    fn check(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    fn sleep(&self, duration: Duration) -> Result<(), RegistryError>;
}

/// Attempt budget with linear backoff. The first attempt runs at once; the
/// wait after failed attempt `n` (1-indexed) is `step * (n - 1)`, so the
/// defaults wait 0s, 5s, ... 25s between seven attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 7,
            step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration) -> Self {
        Self { attempts, step }
    }

    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.step.saturating_mul(failed_attempt.saturating_sub(1))
    }

    /// Sum of every wait when all attempts fail, saturating at `Duration::MAX`.
    pub fn total_wait(&self) -> Duration {
        (1..self.attempts)
            .map(|n| self.delay_after(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Copies an image and returns the manifest bytes written.
pub trait ImageCopier: Send + Sync {
    fn copy(
        &self,
        src: &Locator,
        dest: &Locator,
        src_ctx: &RegistryContext,
        dest_ctx: &RegistryContext,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// Retrying copier over a single-attempt [`Transfer`].
///
/// Every failure is retried the same way until the budget runs out, then the
/// last error is returned. Only cancellation stops the loop early.
pub struct Copier<T, S> {
    transfer: T,
    sleeper: S,
    retry: RetryPolicy,
    policy: TrustPolicy,
}

impl<T: Transfer, S: Sleeper> Copier<T, S> {
    pub fn new(transfer: T, sleeper: S) -> Self {
        Self {
            transfer,
            sleeper,
            retry: RetryPolicy::default(),
            policy: TrustPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: TrustPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<T: Transfer, S: Sleeper> ImageCopier for Copier<T, S> {
    fn copy(
        &self,
        src: &Locator,
        dest: &Locator,
        src_ctx: &RegistryContext,
        dest_ctx: &RegistryContext,
    ) -> Result<Vec<u8>, RegistryError> {
        let policy = PolicyContext::acquire(self.policy);
        let attempts = self.retry.attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.retry.delay_after(attempt - 1);
                debug!("waiting {}s before attempt {attempt}/{attempts}", delay.as_secs());
                self.sleeper.sleep(delay)?;
            }
            self.sleeper.check()?;

            match self.transfer.transfer(src, dest, src_ctx, dest_ctx, &policy) {
                Ok(manifest) => return Ok(manifest),
                Err(e @ RegistryError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    if e.is_blob_unknown() {
                        warn!(
                            "copy {src} -> {dest}: destination reported a blob unknown to registry \
                             (attempt {attempt}/{attempts}): {e}"
                        );
                    }
                    warn!("copy {src} -> {dest} failed (attempt {attempt}/{attempts}): {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RegistryError::Config("retry budget allows no copy attempts".to_owned())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BLOB_UNKNOWN_MESSAGE, CancelToken};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        waits: Mutex<Vec<Duration>>,
    }

    impl Sleeper for &RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Result<(), RegistryError> {
            self.waits.lock().unwrap().push(duration);
            Ok(())
        }
    }

    /// Fails with `message` for the first `failures` calls, then succeeds.
    struct FlakyTransfer {
        failures: u32,
        message: String,
        calls: Mutex<u32>,
    }

    impl FlakyTransfer {
        fn new(failures: u32, message: &str) -> Self {
            Self {
                failures,
                message: message.to_owned(),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Transfer for &FlakyTransfer {
        fn transfer(
            &self,
            _src: &Locator,
            _dest: &Locator,
            _src_ctx: &RegistryContext,
            _dest_ctx: &RegistryContext,
            _policy: &PolicyContext,
        ) -> Result<Vec<u8>, RegistryError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                Err(RegistryError::Http(format!("{} (call {})", self.message, *calls)))
            } else {
                Ok(b"manifest".to_vec())
            }
        }
    }

    fn locators() -> (Locator, Locator) {
        (
            Locator::parse("docker://internal.reg/ns/app@sha256:aaa", None).unwrap(),
            Locator::parse("docker://migration.reg/ns/app:latest", None).unwrap(),
        )
    }

    #[test]
    fn backoff_schedule() {
        let retry = RetryPolicy::default();
        let waits: Vec<u64> = (1..7).map(|n| retry.delay_after(n).as_secs()).collect();
        assert_eq!(waits, vec![0, 5, 10, 15, 20, 25]);
        assert_eq!(retry.total_wait(), Duration::from_secs(75));
    }

    #[test]
    fn huge_step_saturates_instead_of_overflowing() {
        let retry = RetryPolicy::new(7, Duration::from_secs(u64::MAX / 2));
        assert_eq!(retry.delay_after(1), Duration::ZERO);
        assert_eq!(retry.delay_after(6), Duration::MAX);
        assert_eq!(retry.total_wait(), Duration::MAX);
    }

    #[test]
    fn huge_step_is_bounded_by_cancellation() {
        let transfer = FlakyTransfer::new(u32::MAX, "HTTP 503");
        let token = CancelToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let copier = Copier::new(&transfer, token)
            .with_retry(RetryPolicy::new(7, Duration::from_secs(u64::MAX)));
        let (src, dest) = locators();

        let err = copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, RegistryError::Cancelled(_)), "{err}");
        assert!((1..=2).contains(&transfer.calls()));
    }

    #[test]
    fn exhausts_budget_and_returns_last_error() {
        let transfer = FlakyTransfer::new(u32::MAX, "HTTP 500");
        let sleeper = RecordingSleeper::default();
        let copier = Copier::new(&transfer, &sleeper);
        let (src, dest) = locators();

        let err = copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .unwrap_err();

        assert_eq!(transfer.calls(), 7);
        assert!(err.to_string().contains("(call 7)"), "{err}");
        let waits = sleeper.waits.lock().unwrap().clone();
        assert_eq!(waits.len(), 6);
        assert_eq!(waits.iter().sum::<Duration>(), Duration::from_secs(75));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let transfer = FlakyTransfer::new(2, "connection reset");
        let sleeper = RecordingSleeper::default();
        let copier = Copier::new(&transfer, &sleeper);
        let (src, dest) = locators();

        let manifest = copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .unwrap();
        assert_eq!(manifest, b"manifest");
        assert_eq!(transfer.calls(), 3);
        assert_eq!(
            *sleeper.waits.lock().unwrap(),
            vec![Duration::ZERO, Duration::from_secs(5)]
        );
    }

    #[test]
    fn blob_unknown_is_retried_like_any_error() {
        let transfer = FlakyTransfer::new(u32::MAX, BLOB_UNKNOWN_MESSAGE);
        let sleeper = RecordingSleeper::default();
        let copier = Copier::new(&transfer, &sleeper);
        let (src, dest) = locators();

        let err = copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .unwrap_err();
        assert!(err.is_blob_unknown());
        assert_eq!(transfer.calls(), 7);
        assert_eq!(sleeper.waits.lock().unwrap().len(), 6);
    }

    #[test]
    fn custom_budget() {
        let transfer = FlakyTransfer::new(u32::MAX, "boom");
        let sleeper = RecordingSleeper::default();
        let copier = Copier::new(&transfer, &sleeper)
            .with_retry(RetryPolicy::new(2, Duration::from_secs(1)));
        let (src, dest) = locators();
        assert!(copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .is_err());
        assert_eq!(transfer.calls(), 2);
        assert_eq!(*sleeper.waits.lock().unwrap(), vec![Duration::ZERO]);
    }

    #[test]
    fn cancelled_token_stops_before_first_attempt() {
        let transfer = FlakyTransfer::new(0, "unused");
        let token = CancelToken::new();
        token.cancel();
        let copier = Copier::new(&transfer, token);
        let (src, dest) = locators();
        let err = copier
            .copy(&src, &dest, &RegistryContext::default(), &RegistryContext::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled(_)));
        assert_eq!(transfer.calls(), 0);
    }
}
