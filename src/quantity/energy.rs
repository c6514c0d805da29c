use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Accumulated energy in watt-hours.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    PartialEq,
    PartialOrd,
    Serialize,
    derive_more::Add,
    derive_more::AddAssign,
    derive_more::From,
    derive_more::FromStr,
    derive_more::Sub,
    derive_more::SubAssign,
    derive_more::Sum,
)]
pub struct WattHours(pub f64);

impl WattHours {
    pub const ZERO: Self = Self(0.0);

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }

    pub fn max(self, rhs: Self) -> Self {
        Self(self.0.max(rhs.0))
    }
}

impl Display for WattHours {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.0} Wh", self.0)
    }
}
