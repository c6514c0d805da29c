use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{
    core::season::Season,
    prelude::*,
    quantity::{WattHours, Watts},
};

/// On-disk TOML settings. See `sunflower.example.toml` for a commented
/// starting point.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub transport: TransportSettings,
    pub regulation: RegulationSettings,
    pub fallback: FallbackSettings,
    pub weather: WeatherSettings,
    pub persistence: PersistenceSettings,

    /// Priority order: the first entry gets surplus first and is shed last.
    #[serde(default)]
    pub equipment: Vec<EquipmentSettings>,
}

impl Settings {
    pub fn read_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read the settings from `{}`", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse the settings from `{}`", path.display()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    pub consumption_topic: String,
    pub production_topic: String,

    /// Inbound force/unforce commands.
    pub command_topic: String,

    /// Inbound mode level of the priority load's controller.
    pub mode_topic: Option<String>,

    pub status_topic: String,

    /// Downstream energy-meter bridge legs; both must be set to enable it.
    pub grid_topic: Option<String>,
    pub injection_topic: Option<String>,

    #[serde(default = "default_meter_staleness_secs")]
    pub meter_staleness_secs: u64,
}

const fn default_meter_staleness_secs() -> u64 {
    300
}

impl TransportSettings {
    pub fn meter_staleness(&self) -> TimeDelta {
        TimeDelta::seconds(self.meter_staleness_secs as i64)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegulationSettings {
    /// Minimum spacing between two allocation passes. Must stay above the
    /// meter measurement rate.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Hysteresis band within which production and consumption count as
    /// matched.
    pub balance_threshold_watts: f64,

    /// Safety buffer subtracted from production, biasing towards a slight
    /// import over an export.
    pub margin_watts: f64,

    /// Measurements older than this trigger the fail-safe shedding.
    #[serde(default = "default_measurement_timeout_secs")]
    pub measurement_timeout_secs: u64,
}

const fn default_period_secs() -> u64 {
    10
}

const fn default_measurement_timeout_secs() -> u64 {
    120
}

impl RegulationSettings {
    pub fn period(&self) -> TimeDelta {
        TimeDelta::seconds(self.period_secs as i64)
    }

    pub fn measurement_timeout(&self) -> TimeDelta {
        TimeDelta::seconds(self.measurement_timeout_secs as i64)
    }

    pub const fn margin(&self) -> Watts {
        Watts(self.margin_watts)
    }

    pub const fn balance_threshold(&self) -> Watts {
        Watts(self.balance_threshold_watts)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackSettings {
    /// Hour at which a new regulation day begins.
    pub init_hour: u32,

    /// Hour of the daily energy-income check.
    pub check_hour: u32,

    /// Cloud cover at or below this counts as a good forecast.
    pub good_forecast_percent: u8,

    /// Stretch factor on the forced duration, covering resistive losses.
    pub duration_correction: f64,

    /// Cap on the bridging energy when tomorrow looks sunny.
    pub morning_minimum_wh: f64,

    /// Controller level meaning "automatic/solar mode" on the mode topic.
    pub auto_mode_level: u8,

    pub winter: SeasonalFloor,
    pub spring: SeasonalFloor,
    pub summer: SeasonalFloor,
    pub fall: SeasonalFloor,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeasonalFloor {
    pub today_wh: f64,
    pub two_days_wh: f64,
}

pub struct Floor {
    pub today: WattHours,
    pub two_days: WattHours,
}

impl FallbackSettings {
    pub const fn floor(&self, season: Season) -> Floor {
        let floor = match season {
            Season::Winter => self.winter,
            Season::Spring => self.spring,
            Season::Summer => self.summer,
            Season::Fall => self.fall,
        };
        Floor { today: WattHours(floor.today_wh), two_days: WattHours(floor.two_days_wh) }
    }

    pub const fn morning_minimum(&self) -> WattHours {
        WattHours(self.morning_minimum_wh)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeatherSettings {
    /// Location understood by wttr.in, for example a city name.
    pub location: String,

    #[serde(default = "default_weather_retries")]
    pub retries: u32,

    #[serde(default = "default_weather_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

const fn default_weather_retries() -> u32 {
    3
}

const fn default_weather_retry_delay_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceSettings {
    pub path: PathBuf,

    #[serde(default = "default_save_period_secs")]
    pub save_period_secs: u64,
}

const fn default_save_period_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize)]
pub struct EquipmentSettings {
    pub name: String,
    pub command_topic: String,

    /// Direct power readings of this load, used for overload detection.
    pub sensor_topic: Option<String>,

    #[serde(flatten)]
    pub kind: EquipmentKindSettings,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EquipmentKindSettings {
    Variable { calibration_file: PathBuf, min_power_watts: f64, min_percent: f64 },
    Constant { nominal_power_watts: f64 },
    Unknown,
}
