//! User-facing backup settings, persisted in the ledger

use serde::{Deserialize, Serialize};

use chatvault_core::config::SettingsConfig;
use chatvault_core::types::BackupDestination;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSettings {
    pub enabled: bool,
    pub destination: BackupDestination,
    /// Third-party destinations whose risk notice the user has accepted
    #[serde(default)]
    pub acknowledged: Vec<BackupDestination>,
}

impl BackupSettings {
    /// Initial settings when the ledger has none yet
    pub fn from_config(cfg: &SettingsConfig) -> Self {
        let mut acknowledged = Vec::new();
        if cfg.third_party_acknowledged && cfg.destination.requires_explicit_risk_acknowledgement()
        {
            acknowledged.push(cfg.destination.clone());
        }
        Self {
            enabled: cfg.backups_enabled,
            destination: cfg.destination.clone(),
            acknowledged,
        }
    }

    /// Our servers never need acknowledgement
    pub fn is_acknowledged(&self, destination: &BackupDestination) -> bool {
        !destination.requires_explicit_risk_acknowledgement()
            || self.acknowledged.contains(destination)
    }

    pub fn acknowledge(&mut self, destination: &BackupDestination) {
        if destination.requires_explicit_risk_acknowledgement()
            && !self.acknowledged.contains(destination)
        {
            self.acknowledged.push(destination.clone());
        }
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self::from_config(&SettingsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_core::types::ThirdPartyProvider;

    #[test]
    fn test_our_servers_needs_no_acknowledgement() {
        let settings = BackupSettings::default();
        assert!(settings.is_acknowledged(&BackupDestination::OurServers));
        assert!(!settings.is_acknowledged(&BackupDestination::ThirdParty(
            ThirdPartyProvider::GoogleDrive
        )));
    }

    #[test]
    fn test_acknowledgement_is_per_destination() {
        let mut settings = BackupSettings::default();
        let drive = BackupDestination::ThirdParty(ThirdPartyProvider::GoogleDrive);
        let icloud = BackupDestination::ThirdParty(ThirdPartyProvider::ICloud);
        settings.acknowledge(&drive);
        settings.acknowledge(&drive);
        settings.acknowledge(&BackupDestination::OurServers);
        assert_eq!(settings.acknowledged, vec![drive.clone()]);
        assert!(settings.is_acknowledged(&drive));
        assert!(!settings.is_acknowledged(&icloud));
    }

    #[test]
    fn test_from_config_carries_acknowledgement() {
        let cfg = SettingsConfig {
            backups_enabled: true,
            destination: BackupDestination::ThirdParty(ThirdPartyProvider::ICloud),
            third_party_acknowledged: true,
        };
        let settings = BackupSettings::from_config(&cfg);
        assert!(settings.is_acknowledged(&cfg.destination));
    }
}
