//! Daily sweep scheduling
//!
//! The first sweep runs at the next local midnight, then every 24 hours on a
//! fixed period. A tick missed because a sweep overran is skipped, not caught up.

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, TimeZone};
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::sweeper::{SweepError, SweepReport};

pub const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// How far past a nonexistent local midnight (DST gap) to search for a valid time.
const DST_GAP_SEARCH_MINUTES: i64 = 180;

/// Time from `now` until the next local midnight in `now`'s time zone.
///
/// At exactly midnight this is a full day. If the next midnight falls into a DST
/// gap, the first valid minute after it is used.
pub fn duration_until_next_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    let next_day = now
        .date_naive()
        .succ_opt()
        .expect("local date is below chrono's maximum date");
    let midnight: NaiveDateTime = next_day.and_time(chrono::NaiveTime::MIN);

    let target = (0..=DST_GAP_SEARCH_MINUTES)
        .find_map(|minutes| {
            tz.from_local_datetime(&(midnight + TimeDelta::minutes(minutes)))
                .earliest()
        })
        .expect("a DST gap is shorter than the search window");

    target
        .signed_duration_since(now)
        .to_std()
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    first_delay: Duration,
    period: Duration,
}

impl Scheduler {
    pub fn new(first_delay: Duration, period: Duration) -> Self {
        assert!(!period.is_zero(), "Precondition: period must be positive");
        Scheduler {
            first_delay,
            period,
        }
    }

    /// Next local midnight, then every 24 hours.
    pub fn daily_at_local_midnight() -> Self {
        Self::new(duration_until_next_midnight(&Local::now()), SWEEP_PERIOD)
    }

    pub fn first_delay(&self) -> Duration {
        self.first_delay
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Invoke `cycle` on every tick.
    ///
    /// A fatal [`SweepError`] ends the loop and is returned. Non-fatal errors are
    /// logged and the loop waits for the next tick.
    pub async fn run<F, Fut>(&self, mut cycle: F) -> Result<Infallible, SweepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<SweepReport, SweepError>>,
    {
        info!(
            "Next sweep in {:?}, then every {:?}",
            self.first_delay, self.period
        );
        let mut ticks = interval_at(Instant::now() + self.first_delay, self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticks.tick().await;
            match cycle().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Sweep failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Sweep aborted, retrying next cycle: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::BacklogError;
    use crate::store::StoreError;
    use chrono::{FixedOffset, LocalResult, NaiveDate, NaiveTime};
    use std::io;
    use std::sync::{Arc, Mutex};

    fn at(offset_secs: i32, y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(offset_secs)
            .unwrap()
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_delay_until_midnight() {
        let now = at(3600, 2024, 3, 10, 23, 30, 0);
        assert_eq!(duration_until_next_midnight(&now), Duration::from_secs(30 * 60));

        let now = at(-5 * 3600, 2024, 12, 31, 0, 0, 1);
        assert_eq!(
            duration_until_next_midnight(&now),
            Duration::from_secs(24 * 3600 - 1)
        );
    }

    #[test]
    fn test_exactly_midnight_waits_a_full_day() {
        let now = at(0, 2024, 2, 28, 0, 0, 0);
        assert_eq!(duration_until_next_midnight(&now), SWEEP_PERIOD);
    }

    /// Clocks jump from 00:00 -03:00 to 01:00 -02:00 on 2018-11-04, so that
    /// local midnight does not exist.
    #[derive(Debug, Clone, Copy)]
    struct MidnightGap;

    impl MidnightGap {
        const BEFORE: i32 = -3 * 3600;
        const AFTER: i32 = -2 * 3600;

        fn gap_start() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2018, 11, 4)
                .unwrap()
                .and_time(NaiveTime::MIN)
        }

        fn offset(secs: i32) -> FixedOffset {
            FixedOffset::east_opt(secs).unwrap()
        }
    }

    impl TimeZone for MidnightGap {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            MidnightGap
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let gap_start = Self::gap_start();
            if *local < gap_start {
                LocalResult::Single(Self::offset(Self::BEFORE))
            } else if *local < gap_start + TimeDelta::hours(1) {
                LocalResult::None
            } else {
                LocalResult::Single(Self::offset(Self::AFTER))
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_time(NaiveTime::MIN))
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            // 00:00 local at -03:00
            if *utc < Self::gap_start() + TimeDelta::hours(3) {
                Self::offset(Self::BEFORE)
            } else {
                Self::offset(Self::AFTER)
            }
        }
    }

    #[test]
    fn test_missing_midnight_uses_first_valid_minute() {
        let now = MidnightGap.with_ymd_and_hms(2018, 11, 3, 23, 0, 0).unwrap();
        // Next valid local time is 01:00 -02:00, one real hour away.
        assert_eq!(duration_until_next_midnight(&now), Duration::from_secs(3600));

        let after = MidnightGap.with_ymd_and_hms(2018, 11, 4, 1, 0, 0).unwrap();
        assert_eq!(
            duration_until_next_midnight(&after),
            Duration::from_secs(23 * 3600)
        );
    }

    fn store_failure() -> SweepError {
        SweepError::Store {
            key: "k".to_string(),
            attempts: 1,
            remaining: 1,
            source: StoreError::Closed,
        }
    }

    fn backlog_failure() -> SweepError {
        SweepError::Backlog {
            phase: crate::sweeper::SweepPhase::SnapshotCreate,
            source: BacklogError::Io {
                op: "rename",
                path: ".expired_keys".into(),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            },
        }
    }

    #[tokio::test]
    async fn test_run_continues_after_non_fatal_errors() {
        let scheduler = Scheduler::new(Duration::from_millis(5), Duration::from_millis(10));
        let started = Instant::now();
        let mut calls = 0;

        let result = scheduler
            .run(|| {
                calls += 1;
                let outcome = match calls {
                    1 => Ok(SweepReport::default()),
                    2 => Err(store_failure()),
                    _ => Err(backlog_failure()),
                };
                async move { outcome }
            })
            .await;

        assert!(matches!(result, Err(SweepError::Backlog { .. })));
        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_sweep_does_not_catch_up() {
        let period = Duration::from_millis(100);
        let scheduler = Scheduler::new(Duration::from_millis(10), period);
        let started = Instant::now();
        let fired: Arc<Mutex<Vec<Duration>>> = Arc::default();

        let result = scheduler
            .run(|| {
                let fired = fired.clone();
                async move {
                    let call = {
                        let mut fired = fired.lock().unwrap();
                        fired.push(started.elapsed());
                        fired.len()
                    };
                    match call {
                        // Overruns the ticks at 110ms and 210ms
                        1 => {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                            Ok(SweepReport::default())
                        }
                        2 => Ok(SweepReport::default()),
                        _ => Err(backlog_failure()),
                    }
                }
            })
            .await;

        assert!(result.is_err());
        let fired = fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 3);
        assert!(fired[0] >= Duration::from_millis(10) && fired[0] < Duration::from_millis(20));
        // One late tick right away, then back on the period grid.
        assert!(fired[1] >= Duration::from_millis(260) && fired[1] < Duration::from_millis(300));
        assert!(fired[2] >= Duration::from_millis(300) && fired[2] < Duration::from_millis(350));
    }
}
