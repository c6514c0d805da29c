use std::fmt::{Display, Formatter};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::quantity::energy::WattHours;

/// Electrical power. Negative values only ever appear transiently in
/// allocator arithmetic; commanded powers stay in `[0, max]`.
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
    derive_more::Neg,
    derive_more::Sub,
    derive_more::SubAssign,
    derive_more::Sum,
)]
pub struct Watts(pub f64);

impl Watts {
    pub const ZERO: Self = Self(0.0);

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }

    pub fn max(self, rhs: Self) -> Self {
        Self(self.0.max(rhs.0))
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0.0
    }
}

impl Display for Watts {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.0} W", self.0)
    }
}

impl std::ops::Mul<TimeDelta> for Watts {
    type Output = WattHours;

    fn mul(self, rhs: TimeDelta) -> Self::Output {
        WattHours(self.0 * rhs.as_seconds_f64() / 3600.0)
    }
}
