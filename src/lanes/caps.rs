use crate::config::config::LaneBCfg;
use crate::core::error::{CapKind, CapacityExceeded};
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Trailing window for the weekly cap, in calendar days including today.
pub const WEEK_DAYS: u64 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapLimits {
    pub daily_target: u32,
    pub daily_max: u32,
    pub weekly_max: u32,
}

impl From<&LaneBCfg> for CapLimits {
    fn from(cfg: &LaneBCfg) -> Self {
        Self {
            daily_target: cfg.daily_target,
            daily_max: cfg.daily_max,
            weekly_max: cfg.weekly_max,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapUsage {
    pub day: u32,
    pub week: u32,
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    slots: BTreeMap<SlotId, DateTime<Utc>>,
}

/// Promotion slots counted against the daily and weekly caps.
///
/// Every check-and-increment happens under one lock, so concurrent workers
/// can never jointly cross a cap. Released slots free capacity immediately.
pub struct CapLedger {
    limits: CapLimits,
    tz: Tz,
    state: Mutex<LedgerState>,
}

/// UTC instant of local midnight `days_back` days before the local date of `at`.
pub fn local_day_start(at: DateTime<Utc>, tz: Tz, days_back: u64) -> DateTime<Utc> {
    let date = at.with_timezone(&tz).date_naive() - Days::new(days_back);
    midnight(date, tz)
}

fn midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(early, _) => early.with_timezone(&Utc),
        // no local midnight on a DST jump day
        chrono::LocalResult::None => Utc.from_utc_datetime(&naive),
    }
}

impl CapLedger {
    pub fn new(limits: CapLimits, tz: Tz) -> Self {
        Self {
            limits,
            tz,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn limits(&self) -> CapLimits {
        self.limits
    }

    /// Start of the weekly window that `at` falls in.
    pub fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        local_day_start(at, self.tz, WEEK_DAYS - 1)
    }

    /// Seeds the ledger with already completed promotions.
    pub fn hydrate(&self, promotions: impl IntoIterator<Item = DateTime<Utc>>) {
        let mut st = self.state.lock();
        for ts in promotions {
            let id = SlotId(st.next_id);
            st.next_id += 1;
            st.slots.insert(id, ts);
        }
    }

    fn usage_locked(&self, st: &LedgerState, at: DateTime<Utc>) -> CapUsage {
        let today = local_day_start(at, self.tz, 0);
        let week_start = self.window_start(at);
        let tomorrow = today + chrono::Duration::days(1);
        let mut usage = CapUsage::default();
        for ts in st.slots.values() {
            if *ts >= week_start && *ts < tomorrow {
                usage.week += 1;
                if *ts >= today {
                    usage.day += 1;
                }
            }
        }
        usage
    }

    pub fn usage(&self, at: DateTime<Utc>) -> CapUsage {
        let st = self.state.lock();
        self.usage_locked(&st, at)
    }

    fn check(&self, usage: CapUsage, stretch: bool) -> Result<(), CapacityExceeded> {
        let l = self.limits;
        if usage.week >= l.weekly_max {
            return Err(CapacityExceeded {
                kind: CapKind::WeeklyMax,
                limit: l.weekly_max,
                current: usage.week,
            });
        }
        if usage.day >= l.daily_max {
            return Err(CapacityExceeded {
                kind: CapKind::DailyMax,
                limit: l.daily_max,
                current: usage.day,
            });
        }
        if !stretch && usage.day >= l.daily_target {
            return Err(CapacityExceeded {
                kind: CapKind::DailyTarget,
                limit: l.daily_target,
                current: usage.day,
            });
        }
        Ok(())
    }

    /// Atomically checks every cap and takes a slot at `at`.
    pub fn try_reserve(
        &self,
        at: DateTime<Utc>,
        stretch: bool,
    ) -> Result<SlotId, CapacityExceeded> {
        let mut st = self.state.lock();
        let usage = self.usage_locked(&st, at);
        self.check(usage, stretch)?;
        let id = SlotId(st.next_id);
        st.next_id += 1;
        st.slots.insert(id, at);
        Ok(id)
    }

    pub fn release(&self, slot: SlotId) {
        self.state.lock().slots.remove(&slot);
    }

    /// How many more slots could be taken at `at`, and the cap that would
    /// stop the next one. Mutates nothing.
    pub fn headroom(&self, at: DateTime<Utc>, stretch: bool) -> (u32, CapacityExceeded) {
        let st = self.state.lock();
        let mut usage = self.usage_locked(&st, at);
        let mut free = 0;
        loop {
            match self.check(usage, stretch) {
                Ok(()) => {
                    free += 1;
                    usage.day += 1;
                    usage.week += 1;
                }
                Err(binding) => return (free, binding),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn limits() -> CapLimits {
        CapLimits {
            daily_target: 3,
            daily_max: 4,
            weekly_max: 10,
        }
    }

    fn friday_noon() -> DateTime<Utc> {
        // 2026-10-16 is a Friday; 16:00 UTC is midday in New York
        Utc.with_ymd_and_hms(2026, 10, 16, 16, 0, 0).unwrap()
    }

    #[test]
    fn daily_target_binds_without_stretch() {
        let ledger = CapLedger::new(limits(), chrono_tz::America::New_York);
        let at = friday_noon();
        for _ in 0..3 {
            ledger.try_reserve(at, false).unwrap();
        }
        let err = ledger.try_reserve(at, false).unwrap_err();
        assert_eq!(err.kind, CapKind::DailyTarget);

        ledger.try_reserve(at, true).unwrap();
        let err = ledger.try_reserve(at, true).unwrap_err();
        assert_eq!(err.kind, CapKind::DailyMax);
    }

    #[test]
    fn weekly_cap_counts_trailing_seven_days() {
        let ledger = CapLedger::new(limits(), chrono_tz::America::New_York);
        let at = friday_noon();
        // 3 per day on Mon..Wed = 9
        for d in 2..=4 {
            ledger.hydrate((0..3).map(|_| at - Duration::days(d)));
        }
        // and 5 from last week's Thursday, outside the window
        ledger.hydrate((0..5).map(|_| at - Duration::days(8)));
        assert_eq!(ledger.usage(at), CapUsage { day: 0, week: 9 });

        let (free, binding) = ledger.headroom(at, false);
        assert_eq!(free, 1);
        assert_eq!(binding.kind, CapKind::WeeklyMax);

        ledger.try_reserve(at, false).unwrap();
        let err = ledger.try_reserve(at, true).unwrap_err();
        assert_eq!(
            err,
            CapacityExceeded {
                kind: CapKind::WeeklyMax,
                limit: 10,
                current: 10
            }
        );
    }

    #[test]
    fn released_slots_free_capacity() {
        let ledger = CapLedger::new(limits(), chrono_tz::America::New_York);
        let at = friday_noon();
        let slots: Vec<_> = (0..3).map(|_| ledger.try_reserve(at, false).unwrap()).collect();
        assert!(ledger.try_reserve(at, false).is_err());
        ledger.release(slots[1]);
        assert!(ledger.try_reserve(at, false).is_ok());
    }

    #[test]
    fn concurrent_reservations_never_cross_the_cap() {
        let ledger = Arc::new(CapLedger::new(
            CapLimits {
                daily_target: 5,
                daily_max: 6,
                weekly_max: 6,
            },
            chrono_tz::America::New_York,
        ));
        let at = friday_noon();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.try_reserve(at, true).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 6);
    }
}
