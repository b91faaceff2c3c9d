//! Fixed lane triggers. Expressions use the seconds-first cron format and are
//! evaluated in the system timezone.

use crate::core::error::PipelineError;
use crate::lanes::report::Lane;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

pub const SYSTEM_TZ: Tz = chrono_tz::America::New_York;

pub const LANE0_CRON: &str = "0 0 6 * * Mon-Fri";
pub const LANE_A_CRON: &str = "0 0 7 * * Mon-Fri";
pub const LANE_B_CRON: &str = "0 0 8 * * Mon-Fri";
pub const IC_BUNDLE_CRON: &str = "0 0 18 * * Fri";

pub fn cron_for(lane: Lane) -> &'static str {
    match lane {
        Lane::Lane0 => LANE0_CRON,
        Lane::LaneA => LANE_A_CRON,
        Lane::LaneB => LANE_B_CRON,
        Lane::Bundle => IC_BUNDLE_CRON,
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule, PipelineError> {
    Schedule::from_str(expr)
        .map_err(|e| PipelineError::Configuration(format!("invalid cron expression '{expr}': {e}")))
}

/// First firing strictly after `after`.
pub fn next_fire(
    schedule: &Schedule,
    after: DateTime<Utc>,
    tz: Tz,
) -> Result<DateTime<Utc>, PipelineError> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| PipelineError::Configuration("schedule has no upcoming firing".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn all_lane_schedules_parse() {
        for lane in [Lane::Lane0, Lane::LaneA, Lane::LaneB, Lane::Bundle] {
            assert!(parse_cron(cron_for(lane)).is_ok(), "{lane}");
        }
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn weekday_lanes_skip_the_weekend() {
        let schedule = parse_cron(LANE_B_CRON).unwrap();
        // Friday 2026-10-16 12:00 New York
        let friday_noon = Utc.with_ymd_and_hms(2026, 10, 16, 16, 0, 0).unwrap();
        let next = next_fire(&schedule, friday_noon, SYSTEM_TZ).unwrap();
        // Monday 08:00 EDT
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap());
    }

    #[test]
    fn lanes_fire_in_pipeline_order() {
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap();
        let fire = |expr| next_fire(&parse_cron(expr).unwrap(), monday, SYSTEM_TZ).unwrap();
        assert!(fire(LANE0_CRON) < fire(LANE_A_CRON));
        assert!(fire(LANE_A_CRON) < fire(LANE_B_CRON));
    }

    #[test]
    fn bundle_fires_friday_evening_local_time() {
        let schedule = parse_cron(IC_BUNDLE_CRON).unwrap();
        let monday = Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap();
        let next = next_fire(&schedule, monday, SYSTEM_TZ).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 23, 22, 0, 0).unwrap());
    }
}
