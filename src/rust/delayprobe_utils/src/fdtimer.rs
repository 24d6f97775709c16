use nix::sys::{
    time::TimeSpec,
    timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags},
};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// A one-shot Linux `timerfd`, re-armed on every call to `sleep`.
///
/// Used by loops whose interval changes from one iteration to the
/// next (the export scheduler switches between a short and a long
/// sleep depending on worker backlog).
pub struct FdTimer {
    timer: TimerFd,
}

impl FdTimer {
    /// Acquire a monotonic timer fd.
    pub fn new() -> Result<Self, FdTimerError> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::empty()).map_err(|e| {
            error!("Unable to acquire Linux fdtimer: {e:?}");
            FdTimerError::Acquire
        })?;
        Ok(Self { timer })
    }

    /// Block the calling thread for `duration`.
    pub fn sleep(&self, duration: Duration) -> Result<(), FdTimerError> {
        // A zero one-shot expiration disarms the timer and `wait` would never return.
        if duration.is_zero() {
            return Ok(());
        }
        self.timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(duration)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|e| {
                error!("Unable to set the Linux fdtimer interval: {e:?}");
                FdTimerError::Arm
            })?;
        self.timer.wait().map_err(|e| {
            error!("Error in timer wait (Linux fdtimer). This should never happen. {e:?}");
            FdTimerError::Wait
        })
    }
}

/// Errors raised by the fd timer.
#[derive(Error, Debug)]
pub enum FdTimerError {
    /// No timer fd could be created.
    #[error("Unable to acquire Linux fdtimer")]
    Acquire,
    /// The timer could not be armed.
    #[error("Unable to arm Linux fdtimer")]
    Arm,
    /// Waiting on the timer failed.
    #[error("Linux fdtimer wait failed")]
    Wait,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleeps_at_least_the_interval() {
        let timer = FdTimer::new().unwrap();
        let start = Instant::now();
        timer.sleep(Duration::from_millis(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn zero_sleep_returns() {
        let timer = FdTimer::new().unwrap();
        timer.sleep(Duration::ZERO).unwrap();
    }
}
