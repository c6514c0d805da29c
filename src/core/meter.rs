use chrono::{DateTime, Local, TimeDelta};

use crate::{
    quantity::Watts,
    transport::{Frame, Publisher},
};

/// Downstream energy-meter bridge.
///
/// Splits the grid exchange into an import leg and an injection leg and
/// republishes them. Exactly one of the two is non-zero at any time, so the
/// idle leg only sends a zero when it just dropped to zero or when the last
/// zero is older than the staleness window.
pub struct MeterBridge {
    grid: Leg,
    injection: Leg,
    staleness: TimeDelta,
}

struct Leg {
    topic: String,
    last_value: Option<Watts>,
    last_published: Option<DateTime<Local>>,
}

impl Leg {
    fn new(topic: String) -> Self {
        Self { topic, last_value: None, last_published: None }
    }

    fn publish(&mut self, publisher: &Publisher, now: DateTime<Local>, value: Watts, staleness: TimeDelta) {
        let due = if value.is_positive() {
            true
        } else {
            match (self.last_value, self.last_published) {
                (Some(previous), Some(at)) if !previous.is_positive() => now - at >= staleness,
                _ => true,
            }
        };
        if due {
            publisher.publish(Frame::new(
                &self.topic,
                serde_json::json!({ "power": value.0 }).to_string(),
            ));
            self.last_value = Some(value);
            self.last_published = Some(now);
        }
    }
}

impl MeterBridge {
    pub fn new(grid_topic: String, injection_topic: String, staleness: TimeDelta) -> Self {
        Self { grid: Leg::new(grid_topic), injection: Leg::new(injection_topic), staleness }
    }

    /// Publish both legs of the current grid exchange.
    pub fn publish(
        &mut self,
        publisher: &Publisher,
        now: DateTime<Local>,
        production: Watts,
        consumption: Watts,
    ) {
        let grid = (consumption - production).max(Watts::ZERO);
        let injection = (production - consumption).max(Watts::ZERO);
        self.grid.publish(publisher, now, grid, self.staleness);
        self.injection.publish(publisher, now, injection, self.staleness);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(minute: u32, second: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 12, minute, second).unwrap()
    }

    fn drain(receiver: &mut tokio::sync::mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_nonzero_always_published() {
        let (publisher, mut receiver) = Publisher::channel(true);
        let mut bridge =
            MeterBridge::new("meter/grid".into(), "meter/injection".into(), TimeDelta::minutes(5));
        bridge.publish(&publisher, at(0, 0), Watts(2500.0), Watts(2000.0));
        bridge.publish(&publisher, at(0, 10), Watts(2500.0), Watts(2000.0));
        let frames = drain(&mut receiver);
        // The 500 W injection leg twice, the zero grid leg only once:
        assert_eq!(frames.iter().filter(|frame| frame.topic == "meter/injection").count(), 2);
        assert_eq!(frames.iter().filter(|frame| frame.topic == "meter/grid").count(), 1);
    }

    #[test]
    fn test_zero_sent_on_transition() {
        let (publisher, mut receiver) = Publisher::channel(true);
        let mut bridge =
            MeterBridge::new("meter/grid".into(), "meter/injection".into(), TimeDelta::minutes(5));
        bridge.publish(&publisher, at(0, 0), Watts(2000.0), Watts(2500.0));
        drain(&mut receiver);
        // Import flips to injection; the grid leg must report its new zero:
        bridge.publish(&publisher, at(0, 10), Watts(2500.0), Watts(2000.0));
        let frames = drain(&mut receiver);
        assert!(frames.iter().any(|frame| frame.topic == "meter/grid"));
    }

    #[test]
    fn test_zero_reaffirmed_after_staleness_window() {
        let (publisher, mut receiver) = Publisher::channel(true);
        let mut bridge =
            MeterBridge::new("meter/grid".into(), "meter/injection".into(), TimeDelta::minutes(5));
        bridge.publish(&publisher, at(0, 0), Watts(2500.0), Watts(2000.0));
        drain(&mut receiver);
        bridge.publish(&publisher, at(1, 0), Watts(2500.0), Watts(2000.0));
        assert!(drain(&mut receiver).iter().all(|frame| frame.topic != "meter/grid"));
        bridge.publish(&publisher, at(6, 0), Watts(2500.0), Watts(2000.0));
        assert!(drain(&mut receiver).iter().any(|frame| frame.topic == "meter/grid"));
    }
}
