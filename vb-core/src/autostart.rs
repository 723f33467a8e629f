//! Persisted autostart configuration (spec.md §6 "Persisted autostart
//! state"; SPEC_FULL.md §6.1 for the concrete TOML realization). Loaded
//! once by `vb-cli` at startup and replayed into
//! [`crate::manager::DeviceManager::create_device`] calls in file order.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutostartConfig {
    #[serde(default)]
    pub disallowed_drive_letters: String,
    #[serde(default, rename = "device")]
    pub devices: Vec<AutostartDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutostartDevice {
    pub image_file: String,
    pub size: i64,
    #[serde(default)]
    pub flags: u32,
    pub drive_letter: Option<char>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

impl AutostartConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn disallowed_letters(&self) -> crate::manager::DisallowedLetters {
        crate::manager::DisallowedLetters(self.disallowed_drive_letters.chars().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let config = AutostartConfig {
            disallowed_drive_letters: "CZ".to_string(),
            devices: vec![AutostartDevice {
                image_file: "/var/lib/vblock/disk0.img".to_string(),
                size: 1024 * 1024 * 1024,
                flags: 0x0000_0110,
                drive_letter: Some('E'),
                offset: 0,
            }],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autostart.toml");
        config.save(&path).unwrap();

        let loaded = AutostartConfig::load(&path).unwrap();
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].drive_letter, Some('E'));
        assert_eq!(loaded.disallowed_letters().0.len(), 2);
    }

    #[test]
    fn missing_devices_table_defaults_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.toml");
        std::fs::write(&path, "disallowed_drive_letters = \"\"\n").unwrap();

        let loaded = AutostartConfig::load(&path).unwrap();
        assert!(loaded.devices.is_empty());
    }
}
