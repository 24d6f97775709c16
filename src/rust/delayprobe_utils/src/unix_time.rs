//! The two clocks the probe reads: wall time for IPFIX export
//! timestamps, and the boot clock for everything that ages.

use nix::time::{clock_gettime, ClockId};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Seconds since the UNIX epoch, truncated to the 32 bits an IPFIX
/// message header carries.
pub fn export_seconds() -> Result<u32, TimeError> {
  let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| {
    warn!("Wall clock is before the epoch: {e:?}");
    TimeError::ClockNotReady
  })?;
  Ok(since_epoch.as_secs() as u32)
}

/// Nanoseconds on `CLOCK_BOOTTIME`. Flow entries and the timer wheels
/// are stamped with this clock, so suspends do not freeze aging.
pub fn boot_time_nanos() -> Result<u64, TimeError> {
  let now = clock_gettime(ClockId::CLOCK_BOOTTIME).map_err(|e| {
    warn!("Boot clock unavailable: {e:?}");
    TimeError::ClockNotReady
  })?;
  Ok(Duration::from(now).as_nanos() as u64)
}

/// Error type for time functions.
#[derive(Error, Debug)]
pub enum TimeError {
  /// The clock isn't ready yet.
  #[error("Clock not ready")]
  ClockNotReady,
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn boot_clock_moves_forward() {
    let a = boot_time_nanos().unwrap();
    let b = boot_time_nanos().unwrap();
    assert!(b >= a);
  }

  #[test]
  fn export_time_is_after_2020() {
    assert!(export_seconds().unwrap() > 1_577_836_800);
  }
}
