use std::sync::Arc;

use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_with::{TimestampSeconds, serde_as};

use crate::{
    api::wttr::{CloudForecast, ForecastDay},
    config::Settings,
    core::{
        equipment::{Equipment, EquipmentStatus},
        fallback::{self, crossed_hour},
        meter::MeterBridge,
        season::Season,
    },
    prelude::*,
    quantity::{WattHours, Watts},
    snapshot::{EquipmentSnapshot, Snapshot},
    transport::{Frame, Publisher},
};

#[derive(Clone, Copy)]
struct Reading {
    power: Watts,
    at: DateTime<Local>,
}

/// The regulation engine: the single owner of all equipment and accounting
/// state. One dispatch task drives it; nothing here is shared.
pub struct Engine {
    settings: Settings,
    equipments: Vec<Equipment>,
    publisher: Publisher,
    weather: Arc<dyn CloudForecast>,
    meter: Option<MeterBridge>,

    production: Option<Reading>,
    consumption: Option<Reading>,

    /// House production accumulated since the last daily check.
    production_energy: WattHours,

    cloud_forecast: Option<u8>,
    yesterday_energy: WattHours,
    mode_level: Option<u8>,
    last_evaluation: Option<DateTime<Local>>,
    check_done_today: bool,
}

enum Recovery {
    Freed(Watts),
    Insufficient,
    /// A load with unknown draw was touched; the pass must wait for the next
    /// measurement.
    Aborted,
}

impl Engine {
    pub fn new(
        settings: Settings,
        equipments: Vec<Equipment>,
        publisher: Publisher,
        weather: Arc<dyn CloudForecast>,
    ) -> Self {
        let meter = match (&settings.transport.grid_topic, &settings.transport.injection_topic) {
            (Some(grid), Some(injection)) => Some(MeterBridge::new(
                grid.clone(),
                injection.clone(),
                settings.transport.meter_staleness(),
            )),
            _ => None,
        };
        Self {
            settings,
            equipments,
            publisher,
            weather,
            meter,
            production: None,
            consumption: None,
            production_energy: WattHours::ZERO,
            cloud_forecast: None,
            yesterday_energy: WattHours::ZERO,
            mode_level: None,
            last_evaluation: None,
            check_done_today: false,
        }
    }

    /// Seed the accounting from a persisted snapshot, matching by name.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.cloud_forecast = snapshot.cloud_forecast;
        self.yesterday_energy = snapshot.yesterday_energy;
        self.production_energy = snapshot.production_energy;
        for entry in snapshot.equipment {
            match self.equipments.iter_mut().find(|equipment| equipment.name() == entry.name) {
                Some(equipment) => equipment.restore(entry.energy, entry.overloaded),
                None => warn!(name = entry.name, "snapshot entry for an unknown equipment"),
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Local>) -> Snapshot {
        Snapshot {
            cloud_forecast: self.cloud_forecast,
            yesterday_energy: self.yesterday_energy,
            production_energy: self.production_energy,
            equipment: self
                .equipments
                .iter()
                .map(|equipment| EquipmentSnapshot {
                    name: equipment.name().to_owned(),
                    energy: equipment.energy_at(now),
                    overloaded: equipment.is_overloaded(),
                })
                .collect(),
        }
    }

    /// Zero every load at startup so that state and reality agree.
    pub fn start(&mut self, now: DateTime<Local>) {
        for equipment in &mut self.equipments {
            equipment.set_current_power(now, Watts::ZERO);
        }
    }

    /// The mandatory shutdown sequence, part one: shed everything.
    pub fn shutdown(&mut self, now: DateTime<Local>) {
        info!("zeroing all equipment");
        for equipment in &mut self.equipments {
            equipment.set_current_power(now, Watts::ZERO);
        }
    }

    /// Route one inbound frame. Any error is logged and swallowed: mutations
    /// already applied stand, the next measurement retries from scratch.
    pub async fn dispatch(&mut self, frame: Frame, now: DateTime<Local>) {
        if let Err(error) = self.try_dispatch(frame, now).await {
            warn!("the evaluation pass failed: {error:#}");
        }
    }

    async fn try_dispatch(&mut self, frame: Frame, now: DateTime<Local>) -> Result {
        let topic = frame.topic.as_str();
        if topic == self.settings.transport.consumption_topic {
            let reading: PowerPayload =
                serde_json::from_str(&frame.payload).context("malformed consumption payload")?;
            self.consumption = Some(Reading { power: Watts(reading.power), at: now });
            self.evaluate(now).await;
        } else if topic == self.settings.transport.production_topic {
            let reading: PowerPayload =
                serde_json::from_str(&frame.payload).context("malformed production payload")?;
            if let Some(previous) = self.production {
                self.production_energy += previous.power * (now - previous.at);
            }
            self.production = Some(Reading { power: Watts(reading.power), at: now });
            self.evaluate(now).await;
        } else if topic == self.settings.transport.command_topic {
            let command: CommandPayload =
                serde_json::from_str(&frame.payload).context("malformed command payload")?;
            self.handle_command(command, now).await;
        } else if self.settings.transport.mode_topic.as_deref() == Some(topic) {
            let payload: ModePayload =
                serde_json::from_str(&frame.payload).context("malformed mode payload")?;
            debug!(level = payload.level, "mode level");
            self.mode_level = Some(payload.level);
        } else if let Some(index) =
            self.equipments.iter().position(|equipment| equipment.sensor_topic() == Some(topic))
        {
            let reading: PowerPayload =
                serde_json::from_str(&frame.payload).context("malformed sensor payload")?;
            self.equipments[index].check_overload(now, Watts(reading.power));
        } else {
            debug!(topic, "ignoring the frame");
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: CommandPayload, now: DateTime<Local>) {
        match command {
            CommandPayload::Force { name, power, duration } => {
                let Some(equipment) = self.equipment_by_name_mut(&name) else {
                    warn!(name, "cannot force an unknown equipment");
                    return;
                };
                info!(name, power, duration, "forcing");
                let duration = duration.map(|seconds| TimeDelta::seconds(seconds as i64));
                equipment.force(now, Some(Watts(power)), duration);
            }
            CommandPayload::Unforce { name } => {
                let Some(equipment) = self.equipment_by_name_mut(&name) else {
                    warn!(name, "cannot unforce an unknown equipment");
                    return;
                };
                info!(name, "not forcing anymore");
                equipment.force(now, None, None);
            }
        }
        self.evaluate(now).await;
    }

    fn equipment_by_name_mut(&mut self, name: &str) -> Option<&mut Equipment> {
        self.equipments.iter_mut().find(|equipment| equipment.name() == name)
    }

    /// One regulation pass: compare the powers and steer the equipment list.
    pub async fn evaluate(&mut self, now: DateTime<Local>) {
        self.run_boundaries(now).await;

        // Coalesce measurement bursts:
        if let Some(last) = self.last_evaluation
            && now - last < self.settings.regulation.period()
        {
            return;
        }
        self.last_evaluation = Some(now);

        let (Some(production), Some(consumption)) = (self.production, self.consumption) else {
            return;
        };

        let timeout = self.settings.regulation.measurement_timeout();
        if now - production.at > timeout || now - consumption.at > timeout {
            warn!("measurements are stale, shedding all load");
            for equipment in &mut self.equipments {
                if !equipment.is_forced(now) {
                    equipment.set_current_power(now, Watts::ZERO);
                }
            }
            self.publish_status(now, Watts::ZERO, Watts::ZERO);
            return;
        }

        let production = production.power;
        let consumption = consumption.power;
        debug!(%production, %consumption, "evaluating");

        let margin = self.settings.regulation.margin();
        let deficit = consumption - (production - margin);
        let surplus = production - margin - consumption;
        if deficit.is_positive() {
            debug!(%deficit, "decreasing the global consumption");
            self.shed(now, deficit);
        } else if surplus < self.settings.regulation.balance_threshold() {
            debug!("production and consumption are balanced");
        } else {
            debug!(%surplus, "increasing the global consumption");
            self.allocate(now, surplus);
        }

        self.publish_status(now, production, consumption);
    }

    /// Give back `deficit` watts, lowest priority first.
    fn shed(&mut self, now: DateTime<Local>, mut deficit: Watts) {
        for equipment in self.equipments.iter_mut().rev() {
            if equipment.is_forced(now) || equipment.is_overloaded() {
                debug!(name = equipment.name(), "skipping");
                continue;
            }
            match equipment.decrease_power_by(now, deficit) {
                None => {
                    debug!("waiting for the next measurement to see the effect");
                    break;
                }
                Some(freed) => {
                    deficit -= freed;
                    if !deficit.is_positive() {
                        break;
                    }
                }
            }
        }
    }

    /// Hand out `available` watts of surplus, highest priority first,
    /// recovering power from lower-priority loads when a load cannot turn on
    /// with what is offered.
    fn allocate(&mut self, now: DateTime<Local>, mut available: Watts) {
        for index in 0..self.equipments.len() {
            if !available.is_positive() {
                break;
            }
            if self.equipments[index].is_forced(now) || self.equipments[index].is_overloaded() {
                debug!(name = self.equipments[index].name(), "skipping");
                continue;
            }
            match self.equipments[index].increase_power_by(now, available) {
                None => {
                    debug!("waiting for the next measurement to see the effect");
                    break;
                }
                Some(remaining) if remaining == Watts::ZERO => break,
                Some(remaining) if !remaining.is_positive() => {
                    let shortfall = -remaining;
                    match self.recover(now, index, shortfall) {
                        Recovery::Freed(freed) => {
                            match self.equipments[index].increase_power_by(now, available + freed) {
                                None => break,
                                Some(remaining) => available = remaining,
                            }
                        }
                        Recovery::Insufficient => {}
                        Recovery::Aborted => return,
                    }
                }
                Some(remaining) => available = remaining,
            }
        }
    }

    /// Try to free `needed` watts from the loads ranked below `index`,
    /// lowest priority first.
    fn recover(&mut self, now: DateTime<Local>, index: usize, mut needed: Watts) -> Recovery {
        let mut freeable = Watts::ZERO;
        for equipment in &mut self.equipments[index + 1..] {
            if equipment.is_forced(now) {
                continue;
            }
            if let Some(power) = equipment.current_power() {
                freeable += power;
            }
        }
        debug!(%freeable, %needed, "recovery check");
        if freeable < needed {
            debug!("cannot recover enough from lower-priority loads");
            return Recovery::Insufficient;
        }
        let mut freed = Watts::ZERO;
        for equipment in self.equipments[index + 1..].iter_mut().rev() {
            if equipment.is_forced(now) {
                continue;
            }
            match equipment.decrease_power_by(now, needed) {
                None => return Recovery::Aborted,
                Some(partial) => {
                    freed += partial;
                    needed -= partial;
                    if !needed.is_positive() {
                        break;
                    }
                }
            }
        }
        Recovery::Freed(freed)
    }

    async fn run_boundaries(&mut self, now: DateTime<Local>) {
        let Some(previous) = self.last_evaluation else {
            return;
        };
        if crossed_hour(previous, now, self.settings.fallback.init_hour) {
            self.roll_over_day(now);
        }
        if !self.check_done_today && crossed_hour(previous, now, self.settings.fallback.check_hour)
        {
            self.check_done_today = true;
            self.run_daily_check(now).await;
        }
    }

    /// A new regulation day: discard the overnight accrual and give
    /// overloaded loads another chance.
    fn roll_over_day(&mut self, now: DateTime<Local>) {
        info!("starting a new regulation day");
        for equipment in &mut self.equipments {
            let energy = equipment.reset_energy(now);
            debug!(name = equipment.name(), %energy, "rolled over");
            equipment.clear_overload();
        }
        self.check_done_today = false;
    }

    /// The daily income check and, if needed, the grid fallback.
    async fn run_daily_check(&mut self, now: DateTime<Local>) {
        let Some(priority) = self.equipments.first_mut() else {
            return;
        };
        let today = priority.reset_energy(now);
        let overloaded = priority.is_overloaded();
        let max_power = priority.max_power();
        info!(%today, production = %self.production_energy, "daily energy check");
        self.production_energy = WattHours::ZERO;

        let weather = Arc::clone(&self.weather);
        let cloud_percent = match weather.cloud_cover(ForecastDay::Tomorrow).await {
            Ok(cover) => cover,
            Err(error) => {
                warn!("no usable forecast, assuming full cloud cover: {error:#}");
                100
            }
        };
        self.cloud_forecast = Some(cloud_percent);

        let automatic = self
            .mode_level
            .is_none_or(|level| level == self.settings.fallback.auto_mode_level);
        let decision = fallback::decide()
            .settings(&self.settings.fallback)
            .season(Season::on(now.date_naive()))
            .cloud_percent(cloud_percent)
            .today(today)
            .yesterday(self.yesterday_energy)
            .max_power(max_power)
            .overloaded(overloaded)
            .automatic(automatic)
            .call();
        if let Some((watts, duration)) = decision.force
            && let Some(priority) = self.equipments.first_mut()
        {
            priority.force(now, Some(watts), Some(duration));
        }
        self.yesterday_energy = today + decision.planned;
    }

    fn publish_status(&mut self, now: DateTime<Local>, production: Watts, consumption: Watts) {
        let status = Status {
            timestamp: now,
            production,
            consumption,
            grid: (consumption - production).max(Watts::ZERO),
            injection: (production - consumption).max(Watts::ZERO),
            cloud_forecast: self.cloud_forecast,
            yesterday_energy: self.yesterday_energy,
            production_energy: self.production_energy,
            equipment: self.equipments.iter().map(|equipment| equipment.status(now)).collect(),
        };
        match serde_json::to_string(&status) {
            Ok(payload) => self
                .publisher
                .publish(Frame::new(&self.settings.transport.status_topic, payload)),
            Err(error) => warn!(%error, "failed to serialize the status"),
        }
        if let Some(meter) = &mut self.meter {
            meter.publish(&self.publisher, now, production, consumption);
        }
    }
}

#[derive(Deserialize)]
struct PowerPayload {
    power: f64,
}

#[derive(Deserialize)]
struct ModePayload {
    level: u8,
}

#[derive(Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum CommandPayload {
    Force { name: String, power: f64, duration: Option<u64> },
    Unforce { name: String },
}

#[serde_as]
#[derive(Serialize)]
struct Status {
    #[serde_as(as = "TimestampSeconds<i64>")]
    timestamp: DateTime<Local>,
    production: Watts,
    consumption: Watts,
    grid: Watts,
    injection: Watts,
    cloud_forecast: Option<u8>,
    yesterday_energy: WattHours,
    production_energy: WattHours,
    equipment: Vec<EquipmentStatus>,
}
