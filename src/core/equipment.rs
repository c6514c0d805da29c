use chrono::{DateTime, Local, TimeDelta};
use serde::Serialize;

use crate::{
    config::{EquipmentKindSettings, EquipmentSettings},
    core::calibration::CalibrationCurve,
    prelude::*,
    quantity::{WattHours, Watts},
    transport::{Frame, Publisher},
};

/// A direct reading below this is considered "not drawing anything".
const OVERLOAD_THRESHOLD: Watts = Watts(5.0);

/// Consecutive suspicious readings before the overload flag latches.
const OVERLOAD_CHECKS: u32 = 6;

/// Maximum spacing between two suspicious readings for the debounce to
/// keep counting.
const OVERLOAD_WINDOW_SECS: i64 = 10;

/// A controllable electrical load.
///
/// The list position defines the priority: the allocator offers surplus to the
/// front of the list first and sheds from the back first. The variant only
/// decides how an offered budget translates into a command; the bookkeeping
/// is shared.
pub struct Equipment {
    name: String,
    command_topic: String,
    sensor_topic: Option<String>,
    commands: Publisher,
    kind: EquipmentKind,

    /// `None` means the draw is not known (unknown-power load that is on).
    current_power: Option<Watts>,
    last_power_change: Option<DateTime<Local>>,
    energy: WattHours,

    forced: bool,
    force_until: Option<DateTime<Local>>,

    overloaded: bool,
    overload_checks: u32,
    last_overload_check: Option<DateTime<Local>>,
}

pub enum EquipmentKind {
    /// Continuously adjustable via a dimmer, driven through the calibration
    /// curve. The command is a duty-cycle percentage.
    Variable { curve: CalibrationCurve, min_power: Watts, min_percent: f64 },

    /// Plain switch with a known nominal draw.
    Constant { nominal_power: Watts, is_on: bool },

    /// Plain switch whose draw is only learnt from the next measurement.
    Unknown { is_on: bool },
}

impl Equipment {
    pub fn new(
        name: impl Into<String>,
        command_topic: impl Into<String>,
        sensor_topic: Option<String>,
        kind: EquipmentKind,
        commands: Publisher,
    ) -> Self {
        Self {
            name: name.into(),
            command_topic: command_topic.into(),
            sensor_topic,
            commands,
            kind,
            current_power: None,
            last_power_change: None,
            energy: WattHours::ZERO,
            forced: false,
            force_until: None,
            overloaded: false,
            overload_checks: 0,
            last_overload_check: None,
        }
    }

    /// Build from the configuration. Fatal when a calibration file is
    /// missing or unreadable: a variable load cannot run without its curve.
    pub fn from_settings(settings: &EquipmentSettings, commands: Publisher) -> Result<Self> {
        let kind = match &settings.kind {
            EquipmentKindSettings::Variable { calibration_file, min_power_watts, min_percent } => {
                let curve = CalibrationCurve::from_csv_file(calibration_file)
                    .with_context(|| format!("failed to calibrate `{}`", settings.name))?;
                info!(name = settings.name, max_power = %curve.max_power(), "calibrated");
                EquipmentKind::Variable {
                    curve,
                    min_power: Watts(*min_power_watts),
                    min_percent: *min_percent,
                }
            }
            EquipmentKindSettings::Constant { nominal_power_watts } => {
                EquipmentKind::Constant { nominal_power: Watts(*nominal_power_watts), is_on: false }
            }
            EquipmentKindSettings::Unknown => EquipmentKind::Unknown { is_on: false },
        };
        Ok(Self::new(
            settings.name.clone(),
            settings.command_topic.clone(),
            settings.sensor_topic.clone(),
            kind,
            commands,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensor_topic(&self) -> Option<&str> {
        self.sensor_topic.as_deref()
    }

    pub const fn current_power(&self) -> Option<Watts> {
        self.current_power
    }

    pub const fn is_overloaded(&self) -> bool {
        self.overloaded
    }

    /// Highest power this load can be driven at.
    pub fn max_power(&self) -> Watts {
        match &self.kind {
            EquipmentKind::Variable { curve, .. } => curve.max_power(),
            EquipmentKind::Constant { nominal_power, .. } => *nominal_power,
            EquipmentKind::Unknown { .. } => Watts::ZERO,
        }
    }

    /// Integrate the energy drawn at the previous power level.
    fn accrue(&mut self, now: DateTime<Local>) {
        if let (Some(since), Some(power)) = (self.last_power_change, self.current_power) {
            self.energy += power * (now - since);
        }
    }

    /// Accumulated energy including the stretch since the last power change.
    pub fn energy_at(&self, now: DateTime<Local>) -> WattHours {
        match (self.last_power_change, self.current_power) {
            (Some(since), Some(power)) => self.energy + power * (now - since),
            _ => self.energy,
        }
    }

    /// Flush the pending integration, zero the counter, return what it held.
    pub fn reset_energy(&mut self, now: DateTime<Local>) -> WattHours {
        self.accrue(now);
        self.last_power_change = Some(now);
        std::mem::take(&mut self.energy)
    }

    /// Program the load to the given power and emit the matching command.
    pub fn set_current_power(&mut self, now: DateTime<Local>, power: Watts) {
        self.accrue(now);
        self.current_power = Some(power);
        self.last_power_change = Some(now);
        let frame = match &mut self.kind {
            EquipmentKind::Variable { curve, min_percent, .. } => {
                let mut percent =
                    if power.0 == 0.0 { 0.0 } else { curve.watts_to_percent(power) };
                // The dimmer cannot sustain very low duty cycles:
                if percent < *min_percent {
                    percent = 0.0;
                }
                percent = percent.min(100.0);
                debug!(name = self.name, %power, percent, "sending the power command");
                Frame::new(&self.command_topic, format!("{percent:.1}"))
            }
            EquipmentKind::Constant { is_on, .. } | EquipmentKind::Unknown { is_on } => {
                *is_on = power.is_positive();
                debug!(name = self.name, on = *is_on, "sending the switch command");
                Frame::retained(&self.command_topic, if *is_on { "1" } else { "0" })
            }
        };
        self.commands.publish(frame);
    }

    /// Pin the load to the given power (`None` cancels), optionally for a
    /// limited duration.
    pub fn force(
        &mut self,
        now: DateTime<Local>,
        watts: Option<Watts>,
        duration: Option<TimeDelta>,
    ) {
        self.forced = watts.is_some();
        self.force_until = match (watts, duration) {
            (Some(_), Some(duration)) => Some(now + duration),
            _ => None,
        };
        let target = match (&self.kind, watts) {
            (_, None) => Watts::ZERO,
            (EquipmentKind::Constant { nominal_power, .. }, Some(watts)) => {
                if watts >= *nominal_power { *nominal_power } else { Watts::ZERO }
            }
            (_, Some(watts)) => watts,
        };
        self.set_current_power(now, target);
    }

    /// Forced state with lazy expiry: an elapsed deadline clears the flag
    /// right here, on read.
    pub fn is_forced(&mut self, now: DateTime<Local>) -> bool {
        if let Some(until) = self.force_until
            && now > until
        {
            self.forced = false;
            self.force_until = None;
        }
        self.forced
    }

    /// Non-mutating view of the forced flag, for status reporting.
    fn forced_at(&self, now: DateTime<Local>) -> bool {
        self.forced && self.force_until.is_none_or(|until| now <= until)
    }

    /// Give back up to `watts` of the current draw.
    ///
    /// Returns the amount actually freed, or `None` when the effect is only
    /// knowable from the next measurement.
    pub fn decrease_power_by(&mut self, now: DateTime<Local>, watts: Watts) -> Option<Watts> {
        match &self.kind {
            EquipmentKind::Variable { min_power, .. } => {
                let min_power = *min_power;
                let current = self.current_power.unwrap_or_default();
                let mut decrease = watts.min(current);
                // Do not linger below the sustainable floor:
                if current - decrease < min_power {
                    decrease = current;
                }
                if decrease.is_positive() {
                    debug!(name = self.name, %decrease, "decreasing");
                    self.set_current_power(now, current - decrease);
                } else {
                    debug!(name = self.name, "already at 0 W");
                }
                Some(decrease)
            }
            EquipmentKind::Constant { nominal_power, is_on } => {
                if *is_on {
                    let nominal_power = *nominal_power;
                    debug!(name = self.name, %nominal_power, "shutting down");
                    self.set_current_power(now, Watts::ZERO);
                    Some(nominal_power)
                } else {
                    Some(Watts::ZERO)
                }
            }
            EquipmentKind::Unknown { is_on } => {
                if *is_on {
                    debug!(name = self.name, "shutting down an unknown-power load");
                    self.set_current_power(now, Watts::ZERO);
                    None
                } else {
                    Some(Watts::ZERO)
                }
            }
        }
    }

    /// Offer `watts` of budget to the load.
    ///
    /// Returns the part of the offer that is left over. A negative leftover
    /// means the load needs that much more than offered to turn on at all,
    /// and the allocator may recover it from lower-priority loads. `None`
    /// means the resulting draw is only knowable from the next measurement.
    pub fn increase_power_by(&mut self, now: DateTime<Local>, watts: Watts) -> Option<Watts> {
        match &self.kind {
            EquipmentKind::Variable { min_power, .. } => {
                let min_power = *min_power;
                let max_power = self.max_power();
                let current = self.current_power.unwrap_or_default();
                let (increase, remaining) = if current + watts >= max_power {
                    (max_power - current, current + watts - max_power)
                } else {
                    (watts, Watts::ZERO)
                };
                if current + increase < min_power {
                    debug!(name = self.name, %min_power, "the offer does not reach the floor");
                    return Some(watts);
                }
                if increase.is_positive() {
                    debug!(name = self.name, %increase, "increasing");
                    self.set_current_power(now, current + increase);
                }
                Some(remaining)
            }
            EquipmentKind::Constant { nominal_power, is_on } => {
                let nominal_power = *nominal_power;
                if *is_on {
                    Some(watts)
                } else if watts >= nominal_power {
                    debug!(name = self.name, %nominal_power, "turning on");
                    self.set_current_power(now, nominal_power);
                    Some(watts - nominal_power)
                } else {
                    // Short of the nominal draw; the deficit signals how much
                    // should be recovered from lower-priority loads:
                    Some(watts - nominal_power)
                }
            }
            EquipmentKind::Unknown { is_on } => {
                if *is_on {
                    Some(watts)
                } else {
                    debug!(name = self.name, "turning on an unknown-power load");
                    self.accrue(now);
                    self.current_power = None;
                    self.last_power_change = Some(now);
                    self.commands.publish(Frame::retained(&self.command_topic, "1"));
                    if let EquipmentKind::Unknown { is_on } = &mut self.kind {
                        *is_on = true;
                    }
                    None
                }
            }
        }
    }

    /// Debounced overload detection on a fresh direct measurement: a load
    /// that is programmed on but draws nothing is marked overloaded for the
    /// rest of the day.
    pub fn check_overload(&mut self, now: DateTime<Local>, measured: Watts) {
        if self.overloaded {
            return;
        }
        let suspicious = measured < OVERLOAD_THRESHOLD && self.programmed_at_least_minimum();
        if suspicious {
            let continued = self.last_overload_check.is_some_and(|previous| {
                now - previous < TimeDelta::seconds(OVERLOAD_WINDOW_SECS)
            });
            self.overload_checks = if continued { self.overload_checks + 1 } else { 1 };
            if self.overload_checks >= OVERLOAD_CHECKS {
                warn!(name = self.name, %measured, "marking as overloaded for the day");
                self.overloaded = true;
            }
        } else {
            self.overload_checks = 0;
        }
        self.last_overload_check = Some(now);
    }

    fn programmed_at_least_minimum(&self) -> bool {
        match &self.kind {
            EquipmentKind::Variable { min_power, .. } => {
                self.current_power.unwrap_or_default() >= *min_power
            }
            EquipmentKind::Constant { nominal_power, is_on } => {
                *is_on && self.current_power.unwrap_or_default() >= *nominal_power
            }
            EquipmentKind::Unknown { is_on } => *is_on,
        }
    }

    /// Day-boundary rollover of the overload state.
    pub fn clear_overload(&mut self) {
        self.overloaded = false;
        self.overload_checks = 0;
        self.last_overload_check = None;
    }

    /// Seed energy accounting from a persisted snapshot.
    pub fn restore(&mut self, energy: WattHours, overloaded: bool) {
        self.energy = energy;
        self.overloaded = overloaded;
    }

    pub fn status(&self, now: DateTime<Local>) -> EquipmentStatus {
        EquipmentStatus {
            name: self.name.clone(),
            current_power: self.current_power,
            energy: self.energy_at(now),
            overloaded: self.overloaded,
            forced: self.forced_at(now),
        }
    }
}

#[derive(Serialize)]
pub struct EquipmentStatus {
    pub name: String,
    pub current_power: Option<Watts>,
    pub energy: WattHours,
    pub overloaded: bool,
    pub forced: bool,
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, hour, minute, second).unwrap()
    }

    fn variable(min_power: f64) -> (Equipment, UnboundedReceiver<Frame>) {
        let samples =
            (0..=10).map(|step| (f64::from(step) * 10.0, f64::from(step) * 300.0)).collect();
        let curve = CalibrationCurve::from_samples(samples).unwrap();
        let (commands, receiver) = Publisher::channel(true);
        let kind =
            EquipmentKind::Variable { curve, min_power: Watts(min_power), min_percent: 4.0 };
        (Equipment::new("heater", "loads/heater/cmd", None, kind, commands), receiver)
    }

    fn constant(nominal: f64) -> (Equipment, UnboundedReceiver<Frame>) {
        let (commands, receiver) = Publisher::channel(true);
        let kind = EquipmentKind::Constant { nominal_power: Watts(nominal), is_on: false };
        (Equipment::new("charger", "loads/charger/cmd", None, kind, commands), receiver)
    }

    fn unknown() -> (Equipment, UnboundedReceiver<Frame>) {
        let (commands, receiver) = Publisher::channel(true);
        let kind = EquipmentKind::Unknown { is_on: false };
        (Equipment::new("plug", "loads/plug/cmd", None, kind, commands), receiver)
    }

    #[test]
    fn test_constant_decrease_when_off() {
        let (mut equipment, _receiver) = constant(1000.0);
        equipment.set_current_power(at(12, 0, 0), Watts::ZERO);
        assert_eq!(equipment.decrease_power_by(at(12, 0, 4), Watts(500.0)), Some(Watts::ZERO));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_constant_decrease_when_on() {
        let (mut equipment, _receiver) = constant(1000.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1000.0));
        assert_eq!(equipment.decrease_power_by(at(12, 0, 4), Watts(300.0)), Some(Watts(1000.0)));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_constant_increase_needs_more() {
        let (mut equipment, _receiver) = constant(500.0);
        equipment.set_current_power(at(12, 0, 0), Watts::ZERO);
        assert_eq!(equipment.increase_power_by(at(12, 0, 4), Watts(300.0)), Some(Watts(-200.0)));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_constant_increase_turns_on() {
        let (mut equipment, mut receiver) = constant(500.0);
        equipment.set_current_power(at(12, 0, 0), Watts::ZERO);
        assert_eq!(equipment.increase_power_by(at(12, 0, 4), Watts(800.0)), Some(Watts(300.0)));
        assert_eq!(equipment.current_power(), Some(Watts(500.0)));
        receiver.try_recv().unwrap();
        let frame = receiver.try_recv().unwrap();
        assert_eq!(frame.payload, "1");
        assert!(frame.retain);
    }

    #[test]
    fn test_variable_increase_respects_max() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(2800.0));
        let remaining = equipment.increase_power_by(at(12, 0, 4), Watts(1000.0)).unwrap();
        let max_power = equipment.max_power();
        assert!(equipment.current_power().unwrap() <= max_power);
        assert_relative_eq!(
            remaining.0,
            1000.0 - (max_power.0 - 2800.0),
            epsilon = 1.0,
        );
    }

    #[test]
    fn test_variable_increase_below_floor_is_refused() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts::ZERO);
        assert_eq!(equipment.increase_power_by(at(12, 0, 4), Watts(100.0)), Some(Watts(100.0)));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_variable_decrease_never_lingers_below_floor() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(100.0));
        assert_eq!(equipment.decrease_power_by(at(12, 0, 4), Watts(30.0)), Some(Watts(100.0)));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_variable_decrease_scenario() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1000.0));
        assert_eq!(equipment.decrease_power_by(at(12, 0, 4), Watts(650.0)), Some(Watts(650.0)));
        assert_eq!(equipment.current_power(), Some(Watts(350.0)));
    }

    #[test]
    fn test_unknown_signals_unknown_effect() {
        let (mut equipment, _receiver) = unknown();
        assert_eq!(equipment.increase_power_by(at(12, 0, 0), Watts(400.0)), None);
        assert_eq!(equipment.current_power(), None);
        assert_eq!(equipment.decrease_power_by(at(12, 0, 4), Watts(400.0)), None);
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
        assert_eq!(equipment.decrease_power_by(at(12, 0, 8), Watts(400.0)), Some(Watts::ZERO));
    }

    #[test]
    fn test_energy_accrual() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1200.0));
        equipment.set_current_power(at(12, 30, 0), Watts(600.0));
        assert_relative_eq!(equipment.energy_at(at(13, 0, 0)).0, 900.0);
        assert_relative_eq!(equipment.reset_energy(at(13, 0, 0)).0, 900.0);
        assert_relative_eq!(equipment.energy_at(at(13, 0, 0)).0, 0.0);
    }

    #[test]
    fn test_force_expires_lazily() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.force(at(12, 0, 0), Some(Watts(2000.0)), Some(TimeDelta::minutes(10)));
        assert!(equipment.is_forced(at(12, 5, 0)));
        assert_eq!(equipment.current_power(), Some(Watts(2000.0)));
        assert!(!equipment.is_forced(at(12, 11, 0)));
    }

    #[test]
    fn test_unforce_turns_off() {
        let (mut equipment, _receiver) = constant(500.0);
        equipment.force(at(12, 0, 0), Some(Watts(600.0)), None);
        assert_eq!(equipment.current_power(), Some(Watts(500.0)));
        equipment.force(at(12, 5, 0), None, None);
        assert!(!equipment.is_forced(at(12, 5, 0)));
        assert_eq!(equipment.current_power(), Some(Watts::ZERO));
    }

    #[test]
    fn test_overload_latches_after_debounce() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1000.0));
        for check in 0u32..6 {
            assert!(!equipment.is_overloaded());
            equipment.check_overload(at(12, 0, 4 * (check + 1)), Watts(0.0));
        }
        assert!(equipment.is_overloaded());
    }

    #[test]
    fn test_overload_debounce_resets_on_gap() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1000.0));
        for minute in 0u32..10 {
            equipment.check_overload(at(12, minute + 1, 0), Watts(0.0));
        }
        assert!(!equipment.is_overloaded());
    }

    #[test]
    fn test_no_overload_while_drawing() {
        let (mut equipment, _receiver) = variable(150.0);
        equipment.set_current_power(at(12, 0, 0), Watts(1000.0));
        for check in 0u32..10 {
            equipment.check_overload(at(12, 0, 4 * (check + 1)), Watts(995.0));
        }
        assert!(!equipment.is_overloaded());
    }
}
