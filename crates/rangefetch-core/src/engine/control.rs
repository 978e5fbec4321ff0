//! Stop signal shared by everything working on one download run

use crate::error::EngineError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a run was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    Paused = 1,
    Cancelled = 2,
    Aborted = 3,
    TimedOut = 4,
}

impl StopReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StopReason::Paused),
            2 => Some(StopReason::Cancelled),
            3 => Some(StopReason::Aborted),
            4 => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    pub fn into_error(self) -> EngineError {
        match self {
            StopReason::Paused => EngineError::Paused,
            StopReason::Cancelled => EngineError::Cancelled,
            StopReason::Aborted => EngineError::Aborted,
            StopReason::TimedOut => EngineError::RequestTimeout,
        }
    }
}

/// Control handle for one run of a download.
///
/// The first `stop` wins; later calls do not change the reason. `finish` is
/// called by the worker once the run has released its files, so a resume can
/// wait for the previous run before re-queueing.
#[derive(Debug, Default)]
pub struct TransferControl {
    stop: CancellationToken,
    reason: AtomicU8,
    done: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        let _ = self
            .reason
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire);
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// Error to return when the run notices it has been stopped
    pub fn stop_error(&self) -> EngineError {
        self.reason()
            .map(StopReason::into_error)
            .unwrap_or(EngineError::Cancelled)
    }

    /// `Err` with the stop reason if the run should not continue
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_stopped() {
            Err(self.stop_error())
        } else {
            Ok(())
        }
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Sleep that wakes early if the run is stopped
    pub async fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        tokio::select! {
            _ = self.stop.cancelled() => Err(self.stop_error()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn finish(&self) {
        self.done.cancel();
    }

    pub async fn finished(&self) {
        self.done.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let control = TransferControl::new();
        assert!(control.check().is_ok());

        control.stop(StopReason::Paused);
        control.stop(StopReason::Cancelled);

        assert_eq!(control.reason(), Some(StopReason::Paused));
        assert!(matches!(control.check(), Err(EngineError::Paused)));
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_stop() {
        let control = std::sync::Arc::new(TransferControl::new());
        let stopper = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            stopper.stop(StopReason::Cancelled);
        });

        let start = std::time::Instant::now();
        let result = control.sleep(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
