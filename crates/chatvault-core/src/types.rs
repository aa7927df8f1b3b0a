use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::encoding::{hex_decode_array, hex_encode};
use crate::error::ChatvaultError;

/// A message record handed over by the (external) message store, already
/// decrypted from the transport protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl MessageRecord {
    /// Ordering key: timestamp, then id
    pub fn order_key(&self) -> (i64, &str) {
        (self.timestamp, self.id.as_str())
    }
}

/// Sort messages by (timestamp, id).
pub fn sort_messages(messages: &mut [MessageRecord]) {
    messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}

/// Identifier of a backup. Equal to the id of its manifest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupId([u8; BackupId::LEN]);

impl BackupId {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(&self.0))
    }
}

impl fmt::Debug for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackupId({self})")
    }
}

impl FromStr for BackupId {
    type Err = ChatvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex_decode_array(s)
            .map(Self)
            .map_err(|e| ChatvaultError::InvalidId(format!("backup id '{s}': {e}")))
    }
}

impl Serialize for BackupId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BackupId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Full snapshot or delta against a parent backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => f.write_str("full"),
            BackupType::Incremental => f.write_str("incremental"),
        }
    }
}

/// Third-party storage provider a user can pick instead of our servers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThirdPartyProvider {
    GoogleDrive,
    ICloud,
    Other(String),
}

impl ThirdPartyProvider {
    pub fn display_name(&self) -> &str {
        match self {
            ThirdPartyProvider::GoogleDrive => "Google Drive",
            ThirdPartyProvider::ICloud => "iCloud",
            ThirdPartyProvider::Other(name) => name,
        }
    }
}

/// How far the host of a destination is trusted.
///
/// Neither host ever receives key material; the distinction is about who
/// operates the storage and can be compelled to hand over ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    FirstParty,
    ThirdParty,
}

/// Where backups are stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackupDestination {
    OurServers,
    ThirdParty(ThirdPartyProvider),
}

impl BackupDestination {
    pub fn trust_level(&self) -> TrustLevel {
        match self {
            BackupDestination::OurServers => TrustLevel::FirstParty,
            BackupDestination::ThirdParty(_) => TrustLevel::ThirdParty,
        }
    }

    /// True for every third-party destination: the user must acknowledge
    /// the hosting risk before the first backup goes there.
    pub fn requires_explicit_risk_acknowledgement(&self) -> bool {
        self.trust_level() == TrustLevel::ThirdParty
    }

    /// User-facing explanation of the trust distinction, if any.
    pub fn risk_notice(&self) -> Option<String> {
        match self {
            BackupDestination::OurServers => None,
            BackupDestination::ThirdParty(provider) => Some(format!(
                "{name} will store your encrypted backups. Your PIN or passphrase never leaves \
                 this device, so {name} cannot read your messages, but it can be compelled to \
                 hand over the encrypted files and it decides how long they are kept. For the \
                 strongest protection keep backups on our servers.",
                name = provider.display_name()
            )),
        }
    }
}

impl fmt::Display for BackupDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupDestination::OurServers => f.write_str("our_servers"),
            BackupDestination::ThirdParty(ThirdPartyProvider::GoogleDrive) => {
                f.write_str("google_drive")
            }
            BackupDestination::ThirdParty(ThirdPartyProvider::ICloud) => f.write_str("icloud"),
            BackupDestination::ThirdParty(ThirdPartyProvider::Other(name)) => {
                write!(f, "third_party:{name}")
            }
        }
    }
}

impl FromStr for BackupDestination {
    type Err = ChatvaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "our_servers" => Ok(BackupDestination::OurServers),
            "google_drive" => Ok(BackupDestination::ThirdParty(ThirdPartyProvider::GoogleDrive)),
            "icloud" => Ok(BackupDestination::ThirdParty(ThirdPartyProvider::ICloud)),
            other => match other.strip_prefix("third_party:") {
                Some(name) if !name.is_empty() => Ok(BackupDestination::ThirdParty(
                    ThirdPartyProvider::Other(name.to_string()),
                )),
                _ => Err(ChatvaultError::InvalidId(format!(
                    "unknown backup destination '{s}'"
                ))),
            },
        }
    }
}

impl TryFrom<String> for BackupDestination {
    type Error = ChatvaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackupDestination> for String {
    fn from(value: BackupDestination) -> Self {
        value.to_string()
    }
}

/// How often automatic backups run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl BackupFrequency {
    /// Interval in milliseconds (a month counts as 30 days)
    pub fn interval_millis(&self) -> u64 {
        const DAY: u64 = 24 * 60 * 60 * 1000;
        match self {
            BackupFrequency::Daily => DAY,
            BackupFrequency::Weekly => 7 * DAY,
            BackupFrequency::Monthly => 30 * DAY,
        }
    }
}
