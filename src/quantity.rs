pub mod energy;
pub mod power;

pub use self::{energy::WattHours, power::Watts};
