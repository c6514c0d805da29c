use chrono::{Datelike, NaiveDate};

/// Meteorological season, northern hemisphere, by day of year.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Season {
    Spring,
    Summer,
    Fall,
    Winter,
}

impl Season {
    pub fn on(date: NaiveDate) -> Self {
        match date.ordinal() {
            80..=171 => Self::Spring,
            172..=263 => Self::Summer,
            264..=354 => Self::Fall,
            _ => Self::Winter,
        }
    }
}
