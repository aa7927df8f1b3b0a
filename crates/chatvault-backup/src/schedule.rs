//! Automatic backup policy. The host platform owns the timer; this only
//! answers "is a backup due now?".

use chatvault_core::config::AutoBackupConfig;
use chatvault_core::types::BackupFrequency;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoBackupPolicy {
    pub enabled: bool,
    pub frequency: BackupFrequency,
    pub wifi_only: bool,
}

impl AutoBackupPolicy {
    pub fn from_config(cfg: &AutoBackupConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            frequency: cfg.frequency,
            wifi_only: cfg.wifi_only,
        }
    }

    /// `last_completed`: unix ms of the newest completed backup, if any.
    pub fn is_due(&self, last_completed: Option<u64>, now: u64, on_wifi: bool) -> bool {
        if !self.enabled || (self.wifi_only && !on_wifi) {
            return false;
        }
        match last_completed {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.frequency.interval_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: u64 = 24 * 60 * 60 * 1000;

    fn policy(wifi_only: bool) -> AutoBackupPolicy {
        AutoBackupPolicy {
            enabled: true,
            frequency: BackupFrequency::Weekly,
            wifi_only,
        }
    }

    #[test]
    fn test_disabled_is_never_due() {
        let mut p = policy(false);
        p.enabled = false;
        assert!(!p.is_due(None, 10 * DAY, true));
    }

    #[test]
    fn test_first_backup_is_due() {
        assert!(policy(false).is_due(None, 0, false));
    }

    #[test]
    fn test_interval() {
        let p = policy(false);
        assert!(!p.is_due(Some(DAY), 7 * DAY, false));
        assert!(p.is_due(Some(DAY), 8 * DAY, false));
    }

    #[test]
    fn test_wifi_only() {
        let p = policy(true);
        assert!(!p.is_due(None, 0, false));
        assert!(p.is_due(None, 0, true));
    }

    #[test]
    fn test_clock_skew_is_not_due() {
        assert!(!policy(false).is_due(Some(10 * DAY), DAY, true));
    }
}
