use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use aes::Aes256;
use ferry_collectd::parts::{self, PartHeader};
use hmac::{Hmac, Mac};
use ofb::Ofb;
use ofb::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::AuthStore;

const SIGNATURE_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const CHECKSUM_SIZE: usize = 20;

/// The authentication strength of a packet, ordered from weakest to strongest.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Plain packets without authentication.
    #[default]
    None,
    /// Packets signed with HMAC-SHA256.
    Sign,
    /// Packets encrypted with AES-256-OFB.
    Encrypt,
}

impl SecurityLevel {
    /// Returns the lowercase name of this level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sign => "sign",
            Self::Encrypt => "encrypt",
        }
    }

    /// Classifies a frame by its leading part header without consuming it.
    pub fn of_frame(frame: &[u8]) -> Self {
        match PartHeader::peek(frame).map(|h| h.part_type) {
            Some(parts::SIGNATURE) => Self::Sign,
            Some(parts::ENCRYPTION) => Self::Encrypt,
            _ => Self::None,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error returned when parsing an invalid [`SecurityLevel`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid security level, expected one of none, sign, encrypt")]
pub struct ParseSecurityLevelError;

impl FromStr for SecurityLevel {
    type Err = ParseSecurityLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => Self::None,
            "sign" => Self::Sign,
            "encrypt" => Self::Encrypt,
            _ => return Err(ParseSecurityLevelError),
        })
    }
}

/// An error that rejects a whole frame.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum GateError {
    /// The frame is weaker than the configured minimum.
    #[error("{level} frame rejected, minimum security level is {minimum}")]
    BelowMinimum {
        /// The level of the frame.
        level: SecurityLevel,
        /// The configured minimum.
        minimum: SecurityLevel,
    },
    /// The security wrapper is shorter than its layout requires.
    #[error("truncated {0} frame")]
    Truncated(SecurityLevel),
    /// The username is not valid UTF-8.
    #[error("invalid username")]
    InvalidUsername,
    /// The username is not in the auth store.
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    /// The signature does not match the signed data.
    #[error("bad signature from user {0:?}")]
    BadSignature(String),
    /// The decrypted payload does not match its checksum.
    #[error("bad checksum in frame from user {0:?}")]
    BadChecksum(String),
    /// The frame requires credentials, but no auth store is configured.
    #[error("{0} frame received without an auth file configured")]
    CryptoUnavailable(SecurityLevel),
}

impl GateError {
    /// A short, stable identifier of the error for metric tags.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::BelowMinimum { .. } => "below_minimum",
            Self::Truncated(_) => "truncated_frame",
            Self::InvalidUsername => "invalid_username",
            Self::UnknownUser(_) => "unknown_user",
            Self::BadSignature(_) => "bad_signature",
            Self::BadChecksum(_) => "bad_checksum",
            Self::CryptoUnavailable(_) => "crypto_unavailable",
        }
    }
}

/// Enforces a minimum security level and unwraps signed or encrypted frames.
///
/// | frame     | minimum `none`          | minimum `sign`     | minimum `encrypt` |
/// |-----------|-------------------------|--------------------|-------------------|
/// | plain     | passed through          | rejected           | rejected          |
/// | signed    | stripped, not verified  | verified, stripped | rejected          |
/// | encrypted | decrypted, verified     | decrypted, verified| decrypted, verified |
#[derive(Clone, Debug)]
pub struct CryptoGate {
    minimum: SecurityLevel,
    store: Option<Arc<AuthStore>>,
}

impl CryptoGate {
    /// Creates a gate with the given minimum and credential store.
    pub fn new(minimum: SecurityLevel, store: Option<Arc<AuthStore>>) -> Self {
        Self { minimum, store }
    }

    /// The configured minimum security level.
    pub fn minimum(&self) -> SecurityLevel {
        self.minimum
    }

    /// Returns the payload wrapped by `frame`, or rejects the frame.
    ///
    /// Plain frames are returned unchanged. For signed frames, the wrapped payload is the rest of
    /// the frame after the signature part, which is returned without copying. Encrypted frames are
    /// decrypted into a new buffer.
    pub fn gate<'a>(&self, frame: &'a [u8]) -> Result<Cow<'a, [u8]>, GateError> {
        let level = SecurityLevel::of_frame(frame);
        if level < self.minimum {
            return Err(GateError::BelowMinimum {
                level,
                minimum: self.minimum,
            });
        }

        match level {
            SecurityLevel::None => Ok(Cow::Borrowed(frame)),
            SecurityLevel::Sign => self.verify_signed(frame).map(Cow::Borrowed),
            SecurityLevel::Encrypt => self.decrypt(frame).map(Cow::Owned),
        }
    }

    fn store(&self, level: SecurityLevel) -> Result<&AuthStore, GateError> {
        self.store
            .as_deref()
            .ok_or(GateError::CryptoUnavailable(level))
    }

    fn verify_signed<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8], GateError> {
        let truncated = GateError::Truncated(SecurityLevel::Sign);
        let (part, rest) = split_part(frame).ok_or(truncated.clone())?;
        if part.len() < SIGNATURE_SIZE {
            return Err(truncated);
        }

        if self.minimum == SecurityLevel::None {
            return Ok(rest);
        }

        let (signature, username) = part.split_at(SIGNATURE_SIZE);
        let username = std::str::from_utf8(username).map_err(|_| GateError::InvalidUsername)?;

        let credentials = self.store(SecurityLevel::Sign)?.credentials();
        let secret = credentials
            .get(username)
            .ok_or_else(|| GateError::UnknownUser(username.to_owned()))?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| GateError::BadSignature(username.to_owned()))?;
        mac.update(username.as_bytes());
        mac.update(rest);
        mac.verify_slice(signature)
            .map_err(|_| GateError::BadSignature(username.to_owned()))?;

        Ok(rest)
    }

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, GateError> {
        let truncated = GateError::Truncated(SecurityLevel::Encrypt);
        let (part, rest) = split_part(frame).ok_or(truncated.clone())?;
        if !rest.is_empty() {
            ferry_log::debug!(len = rest.len(), "ignoring data after encrypted part");
        }

        let (username_len, part) = part.split_first_chunk::<2>().ok_or(truncated.clone())?;
        let username_len = usize::from(u16::from_be_bytes(*username_len));
        if part.len() < username_len + IV_SIZE + CHECKSUM_SIZE {
            return Err(truncated);
        }

        let (username, part) = part.split_at(username_len);
        let (iv, ciphertext) = part.split_at(IV_SIZE);
        let username = std::str::from_utf8(username).map_err(|_| GateError::InvalidUsername)?;

        let credentials = self.store(SecurityLevel::Encrypt)?.credentials();
        let secret = credentials
            .get(username)
            .ok_or_else(|| GateError::UnknownUser(username.to_owned()))?;

        let key = Sha256::digest(secret.as_bytes());
        let mut plaintext = ciphertext.to_vec();
        Ofb::<Aes256>::new_from_slices(&key, iv)
            .map_err(|_| GateError::Truncated(SecurityLevel::Encrypt))?
            .apply_keystream(&mut plaintext);

        let inner = plaintext.split_off(CHECKSUM_SIZE);
        if Sha1::digest(&inner).as_slice() != plaintext.as_slice() {
            return Err(GateError::BadChecksum(username.to_owned()));
        }

        Ok(inner)
    }
}

/// Splits the leading part's payload from the rest of the frame.
fn split_part(frame: &[u8]) -> Option<(&[u8], &[u8])> {
    let header = PartHeader::peek(frame)?;
    let length = usize::from(header.length);
    header.payload_len()?;

    let part = frame.get(parts::HEADER_SIZE..length)?;
    Some((part, &frame[length..]))
}
