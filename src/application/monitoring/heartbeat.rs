use crate::domain::errors::EngineError;
use crate::domain::events::RunEvent;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Detects a live synchronizer that keeps answering `Pending` while streams are active.
///
/// Each expiry of `stall_timeout` without a batch counts as one stall. Stalls are only
/// reported unless `max_consecutive_stalls` is set, in which case reaching it is fatal.
pub struct SynchronizationWatchdog {
    stall_timeout: Duration,
    max_consecutive_stalls: Option<u32>,
    last_progress: Option<DateTime<Utc>>,
    consecutive: u32,
}

impl SynchronizationWatchdog {
    pub fn new(stall_timeout: Duration, max_consecutive_stalls: Option<u32>) -> Self {
        Self {
            stall_timeout,
            max_consecutive_stalls,
            last_progress: None,
            consecutive: 0,
        }
    }

    /// A batch was emitted at `now`.
    pub fn record_progress(&mut self, now: DateTime<Utc>) {
        self.last_progress = Some(now);
        self.consecutive = 0;
    }

    pub fn consecutive_stalls(&self) -> u32 {
        self.consecutive
    }

    /// Checks for a stall after a `Pending` poll.
    pub fn check(&mut self, now: DateTime<Utc>) -> Result<Option<RunEvent>, EngineError> {
        let Some(last) = self.last_progress else {
            self.last_progress = Some(now);
            return Ok(None);
        };
        let waited = now - last;
        if waited < self.stall_timeout {
            return Ok(None);
        }

        self.consecutive += 1;
        self.last_progress = Some(now);
        let waited_ms = waited.num_milliseconds().max(0) as u64;
        warn!(
            "SynchronizationWatchdog: no batch for {}ms ({} consecutive stalls)",
            waited_ms, self.consecutive
        );

        if let Some(max) = self.max_consecutive_stalls
            && self.consecutive >= max
        {
            return Err(EngineError::SynchronizationStall {
                waited_ms,
                consecutive: self.consecutive,
            });
        }
        debug!("SynchronizationWatchdog: stall reported, run continues");
        Ok(Some(RunEvent::SynchronizationStall {
            waited_ms,
            consecutive: self.consecutive,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, second).unwrap()
    }

    #[test]
    fn test_progress_keeps_watchdog_quiet() {
        let mut watchdog = SynchronizationWatchdog::new(Duration::seconds(5), None);
        assert!(watchdog.check(at(0)).unwrap().is_none());
        watchdog.record_progress(at(4));
        assert!(watchdog.check(at(8)).unwrap().is_none());
    }

    #[test]
    fn test_stalls_are_reported_and_counted() {
        let mut watchdog = SynchronizationWatchdog::new(Duration::seconds(5), None);
        watchdog.record_progress(at(0));

        let event = watchdog.check(at(5)).unwrap();
        assert_eq!(
            event,
            Some(RunEvent::SynchronizationStall {
                waited_ms: 5000,
                consecutive: 1
            })
        );
        assert!(watchdog.check(at(7)).unwrap().is_none());
        assert!(watchdog.check(at(10)).unwrap().is_some());
        assert_eq!(watchdog.consecutive_stalls(), 2);

        watchdog.record_progress(at(11));
        assert_eq!(watchdog.consecutive_stalls(), 0);
    }

    #[test]
    fn test_escalates_when_configured() {
        let mut watchdog = SynchronizationWatchdog::new(Duration::seconds(1), Some(2));
        watchdog.record_progress(at(0));
        assert!(watchdog.check(at(1)).is_ok());
        let err = watchdog.check(at(2)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SynchronizationStall { consecutive: 2, .. }
        ));
    }
}
