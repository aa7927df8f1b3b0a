//! User-supplied backup secret: a numeric PIN or a passphrase.
//!
//! The secret lives in a `SecretString` (zeroized on drop) and is consumed
//! by key derivation, so it never outlives a single unlock.

use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

pub const PIN_MIN_LEN: usize = 6;
pub const PIN_MAX_LEN: usize = 8;
pub const PASSPHRASE_MIN_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Pin,
    Passphrase,
}

pub struct BackupSecret {
    kind: SecretKind,
    value: SecretString,
}

impl BackupSecret {
    pub fn pin(value: impl Into<String>) -> Self {
        Self {
            kind: SecretKind::Pin,
            value: SecretString::from(value.into()),
        }
    }

    pub fn passphrase(value: impl Into<String>) -> Self {
        Self {
            kind: SecretKind::Passphrase,
            value: SecretString::from(value.into()),
        }
    }

    pub fn kind(&self) -> SecretKind {
        self.kind
    }

    /// Reject secrets that are too short or trivially guessable.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let value = self.value.expose_secret();
        match self.kind {
            SecretKind::Pin => validate_pin(value),
            SecretKind::Passphrase => {
                if value.chars().count() < PASSPHRASE_MIN_LEN {
                    return Err(CryptoError::WeakSecret(format!(
                        "passphrase must be at least {PASSPHRASE_MIN_LEN} characters"
                    )));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl std::fmt::Debug for BackupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSecret")
            .field("kind", &self.kind)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

fn validate_pin(pin: &str) -> Result<(), CryptoError> {
    if !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::WeakSecret("PIN must contain only digits".into()));
    }
    if pin.len() < PIN_MIN_LEN || pin.len() > PIN_MAX_LEN {
        return Err(CryptoError::WeakSecret(format!(
            "PIN must be {PIN_MIN_LEN}-{PIN_MAX_LEN} digits"
        )));
    }

    // Compared in place: no copy of the digits outlives the SecretString.
    let digits = pin.as_bytes();
    if digits.windows(2).all(|w| w[0] == w[1]) {
        return Err(CryptoError::WeakSecret("PIN must not repeat a single digit".into()));
    }
    if digits.windows(2).all(|w| w[1] == w[0] + 1) || digits.windows(2).all(|w| w[0] == w[1] + 1)
    {
        return Err(CryptoError::WeakSecret("PIN must not be a sequential run".into()));
    }
    Ok(())
}
