use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{prelude::*, quantity::WattHours};

/// Engine state that must survive a restart: the daily energy accounting
/// would otherwise start from zero and the evening fallback would buy energy
/// the panels already delivered.
#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Snapshot {
    pub cloud_forecast: Option<u8>,

    /// The priority load's income on the previous day.
    pub yesterday_energy: WattHours,

    /// Production accumulated since the last daily check.
    pub production_energy: WattHours,

    pub equipment: Vec<EquipmentSnapshot>,
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct EquipmentSnapshot {
    pub name: String,
    pub energy: WattHours,
    pub overloaded: bool,
}

impl Snapshot {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn read_from(path: &Path) -> Self {
        Self::read_fallibly_from(path).unwrap_or_else(|error| {
            error!("failed to load the snapshot: {error:#}");
            Self::default()
        })
    }

    fn read_fallibly_from(path: &Path) -> Result<Self> {
        if path.is_file() {
            Ok(serde_json::from_slice(&std::fs::read(path)?)?)
        } else {
            Ok(Self::default())
        }
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn write_to(&self, path: &Path) {
        let result = serde_json::to_vec_pretty(self)
            .map_err(Error::from)
            .and_then(|contents| std::fs::write(path, contents).map_err(Error::from));
        if let Err(error) = result {
            error!("failed to save the snapshot: {error:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cloud_forecast: Option<u8>) -> Snapshot {
        Snapshot {
            cloud_forecast,
            yesterday_energy: WattHours(4321.0),
            production_energy: WattHours(10500.5),
            equipment: vec![
                EquipmentSnapshot {
                    name: "water-heater".into(),
                    energy: WattHours(2345.0),
                    overloaded: false,
                },
                EquipmentSnapshot {
                    name: "charger".into(),
                    energy: WattHours(0.0),
                    overloaded: true,
                },
            ],
        }
    }

    #[test]
    fn test_file_round_trip() -> Result {
        let file = tempfile::NamedTempFile::new()?;
        let original = snapshot(Some(85));
        original.write_to(file.path());
        assert_eq!(Snapshot::read_from(file.path()), original);
        Ok(())
    }

    #[test]
    fn test_round_trip_with_null_forecast() -> Result {
        let original = snapshot(None);
        let parsed: Snapshot = serde_json::from_str(&serde_json::to_string(&original)?)?;
        assert_eq!(parsed, original);
        Ok(())
    }

    #[test]
    fn test_missing_file_defaults() {
        let snapshot = Snapshot::read_from(Path::new("does-not-exist.json"));
        assert_eq!(snapshot, Snapshot::default());
    }
}
