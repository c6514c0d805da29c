//! Daily energy-income fallback for the priority load.
//!
//! The router only feeds the water heater with solar surplus during the day.
//! When the day's income stays under the seasonal floor, the heater is forced
//! on the grid overnight, scaled by the cloud forecast so that no energy is
//! bought that tomorrow's sun would deliver anyway.

use chrono::{DateTime, Local, NaiveTime, TimeDelta};

use crate::{
    config::FallbackSettings,
    core::season::Season,
    prelude::*,
    quantity::{WattHours, Watts},
};

/// Whether the local wall clock crossed `hour:00` between two evaluations.
pub fn crossed_hour(previous: DateTime<Local>, now: DateTime<Local>, hour: u32) -> bool {
    let Some(boundary_time) = NaiveTime::from_hms_opt(hour, 0, 0) else {
        return false;
    };
    let boundary = now.date_naive().and_time(boundary_time);
    let previous = previous.naive_local();
    let now = now.naive_local();
    previous < boundary && boundary <= now
}

pub struct Decision {
    /// Forced power and duration for the priority load, if any.
    pub force: Option<(Watts, TimeDelta)>,

    /// Energy the forcing is planned to add, counted into "yesterday".
    pub planned: WattHours,
}

impl Decision {
    const NONE: Self = Self { force: None, planned: WattHours::ZERO };
}

/// The daily check, run once after the check-hour boundary.
///
/// The good-forecast and bad-forecast branches use different cutoffs; do not
/// merge them.
#[bon::builder]
pub fn decide(
    settings: &FallbackSettings,
    season: Season,
    cloud_percent: u8,
    today: WattHours,
    yesterday: WattHours,
    max_power: Watts,
    overloaded: bool,
    automatic: bool,
) -> Decision {
    if !automatic {
        debug!("the priority load is not in automatic mode, skipping the fallback");
        return Decision::NONE;
    }
    if overloaded {
        debug!("the priority load is overloaded, treating today's energy as satisfied");
        return Decision::NONE;
    }
    if !max_power.is_positive() {
        return Decision::NONE;
    }

    let floor = settings.floor(season);
    if today >= floor.today {
        debug!(%today, floor = %floor.today, "today's income is above the floor");
        return Decision::NONE;
    }

    let shortfall_today = floor.today - today;
    let two_days = yesterday + today;
    let needed = if cloud_percent <= settings.good_forecast_percent {
        // Tomorrow looks sunny: only bridge what the two-day balance really
        // misses, and never more than the morning minimum.
        let shortfall_two_days = (floor.two_days - two_days).max(WattHours::ZERO);
        shortfall_today.min(shortfall_two_days).min(settings.morning_minimum())
    } else {
        match season {
            Season::Summer if two_days >= floor.two_days => {
                debug!("summer two-day floor is met, skipping despite the bad forecast");
                return Decision::NONE;
            }
            Season::Winter => shortfall_today,
            _ => WattHours(shortfall_today.0 * f64::from(cloud_percent.min(100)) / 100.0),
        }
    };
    if needed <= WattHours::ZERO {
        return Decision::NONE;
    }

    // Resistive losses make the nominal integration optimistic:
    let seconds = 3600.0 * needed.0 / max_power.0 * settings.duration_correction;
    info!(
        %today,
        %yesterday,
        cloud_percent,
        %needed,
        seconds,
        "forcing the priority load to cover the energy shortfall",
    );
    Decision { force: Some((max_power, TimeDelta::seconds(seconds as i64))), planned: needed }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::SeasonalFloor;

    fn settings() -> FallbackSettings {
        FallbackSettings {
            init_hour: 6,
            check_hour: 16,
            good_forecast_percent: 40,
            duration_correction: 1.2,
            morning_minimum_wh: 1500.0,
            auto_mode_level: 10,
            winter: SeasonalFloor { today_wh: 6000.0, two_days_wh: 9000.0 },
            spring: SeasonalFloor { today_wh: 4000.0, two_days_wh: 7000.0 },
            summer: SeasonalFloor { today_wh: 3000.0, two_days_wh: 5000.0 },
            fall: SeasonalFloor { today_wh: 4000.0, two_days_wh: 7000.0 },
        }
    }

    fn run(
        season: Season,
        cloud_percent: u8,
        today: f64,
        yesterday: f64,
        max_power: f64,
        overloaded: bool,
        automatic: bool,
    ) -> Decision {
        decide()
            .settings(&settings())
            .season(season)
            .cloud_percent(cloud_percent)
            .today(WattHours(today))
            .yesterday(WattHours(yesterday))
            .max_power(Watts(max_power))
            .overloaded(overloaded)
            .automatic(automatic)
            .call()
    }

    #[test]
    fn test_crossed_hour() {
        let previous = Local.with_ymd_and_hms(2025, 1, 10, 15, 59, 50).unwrap();
        let now = Local.with_ymd_and_hms(2025, 1, 10, 16, 0, 5).unwrap();
        assert!(crossed_hour(previous, now, 16));
        assert!(!crossed_hour(previous, now, 17));
        assert!(!crossed_hour(now, now + TimeDelta::seconds(10), 16));
    }

    #[test]
    fn test_winter_bad_forecast_forces_full_shortfall() {
        let decision = run(Season::Winter, 80, 2000.0, 3000.0, 2400.0, false, true);
        let (watts, duration) = decision.force.expect("the shortfall must be covered");
        assert_eq!(watts, Watts(2400.0));
        // 4000 Wh at 2400 W, corrected by 1.2: exactly 2 hours:
        assert_eq!(duration, TimeDelta::seconds(7200));
        assert_eq!(decision.planned, WattHours(4000.0));
    }

    #[test]
    fn test_no_forcing_above_floor() {
        let decision = run(Season::Winter, 80, 6500.0, 0.0, 2400.0, false, true);
        assert!(decision.force.is_none());
        assert_eq!(decision.planned, WattHours::ZERO);
    }

    #[test]
    fn test_summer_bad_forecast_skips_when_two_day_floor_met() {
        let decision = run(Season::Summer, 90, 1000.0, 4500.0, 2400.0, false, true);
        assert!(decision.force.is_none());
    }

    #[test]
    fn test_shoulder_season_weights_by_cloud_cover() {
        // 2000 Wh shortfall weighted by 50 % cloud cover:
        let decision = run(Season::Fall, 50, 2000.0, 0.0, 2000.0, false, true);
        assert_eq!(decision.planned, WattHours(1000.0));
    }

    #[test]
    fn test_good_forecast_is_capped_at_morning_minimum() {
        // Today's shortfall is 5000 Wh and the two-day shortfall 7000 Wh,
        // but a sunny tomorrow only warrants the morning minimum:
        let decision = run(Season::Winter, 10, 1000.0, 1000.0, 2400.0, false, true);
        assert_eq!(decision.planned, WattHours(1500.0));
    }

    #[test]
    fn test_good_forecast_with_two_day_balance_met() {
        let decision = run(Season::Winter, 10, 4000.0, 9000.0, 2400.0, false, true);
        assert!(decision.force.is_none());
    }

    #[test]
    fn test_overloaded_load_is_left_alone() {
        let decision = run(Season::Winter, 80, 0.0, 0.0, 2400.0, true, true);
        assert!(decision.force.is_none());
    }

    #[test]
    fn test_manual_mode_skips_the_fallback() {
        let decision = run(Season::Winter, 80, 0.0, 0.0, 2400.0, false, false);
        assert!(decision.force.is_none());
    }
}
