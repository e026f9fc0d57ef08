//! Helpers to assemble collectd packets in tests.

use aes::Aes256;
use hmac::{Hmac, Mac};
use ofb::Ofb;
use ofb::cipher::{KeyIvInit, StreamCipher};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::RawValue;
use crate::parts::{self, PartHeader};

/// Assembles a plain collectd packet part by part.
///
/// ```
/// use ferry_collectd::RawValue;
/// use ferry_collectd::testutils::PacketBuilder;
///
/// let packet = PacketBuilder::new()
///     .host("web01")
///     .plugin("load")
///     .type_name("load")
///     .values(&[RawValue::Gauge(0.1), RawValue::Gauge(0.2), RawValue::Gauge(0.3)])
///     .build();
/// # assert!(!packet.is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct PacketBuilder {
    buf: Vec<u8>,
}

impl PacketBuilder {
    /// Creates an empty packet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a host part.
    pub fn host(self, host: &str) -> Self {
        self.string(parts::HOST, host)
    }

    /// Appends a plugin part.
    pub fn plugin(self, plugin: &str) -> Self {
        self.string(parts::PLUGIN, plugin)
    }

    /// Appends a plugin instance part.
    pub fn plugin_instance(self, instance: &str) -> Self {
        self.string(parts::PLUGIN_INSTANCE, instance)
    }

    /// Appends a type part.
    pub fn type_name(self, type_name: &str) -> Self {
        self.string(parts::TYPE, type_name)
    }

    /// Appends a type instance part.
    pub fn type_instance(self, instance: &str) -> Self {
        self.string(parts::TYPE_INSTANCE, instance)
    }

    /// Appends a time part in whole seconds.
    pub fn time(self, secs: u64) -> Self {
        self.number(parts::TIME, secs)
    }

    /// Appends a high resolution time part.
    pub fn time_hr(self, secs: f64) -> Self {
        self.number(parts::TIME_HR, (secs * parts::HR_UNITS_PER_SECOND) as u64)
    }

    /// Appends an interval part in whole seconds.
    pub fn interval(self, secs: u64) -> Self {
        self.number(parts::INTERVAL, secs)
    }

    /// Appends a high resolution interval part.
    pub fn interval_hr(self, secs: f64) -> Self {
        self.number(parts::INTERVAL_HR, (secs * parts::HR_UNITS_PER_SECOND) as u64)
    }

    /// Appends a values part.
    pub fn values(self, values: &[RawValue]) -> Self {
        let count = u16::try_from(values.len()).expect("too many values");

        let mut payload = count.to_be_bytes().to_vec();
        payload.extend(values.iter().map(|v| v.kind().code()));
        for value in values {
            payload.extend_from_slice(&value.to_wire());
        }

        self.raw_part(parts::VALUES, &payload)
    }

    /// Appends an arbitrary part with a correct header.
    pub fn raw_part(mut self, part_type: u16, payload: &[u8]) -> Self {
        let length = u16::try_from(parts::HEADER_SIZE + payload.len()).expect("part too large");
        PartHeader { part_type, length }.write_to(&mut self.buf);
        self.buf.extend_from_slice(payload);
        self
    }

    /// Returns the plain packet.
    pub fn build(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the packet wrapped in a signature part.
    pub fn build_signed(self, username: &str, secret: &str) -> Vec<u8> {
        sign(username, secret, &self.buf)
    }

    /// Returns the packet wrapped in an encryption part.
    pub fn build_encrypted(self, username: &str, secret: &str, iv: [u8; 16]) -> Vec<u8> {
        encrypt(username, secret, iv, &self.buf)
    }

    fn string(self, part_type: u16, value: &str) -> Self {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        self.raw_part(part_type, &payload)
    }

    fn number(self, part_type: u16, value: u64) -> Self {
        self.raw_part(part_type, &value.to_be_bytes())
    }
}

/// Prepends a signature part to `payload`, signed with HMAC-SHA256 over the username and payload.
pub fn sign(username: &str, secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC takes any key");
    mac.update(username.as_bytes());
    mac.update(payload);
    let signature = mac.finalize().into_bytes();

    let length = parts::HEADER_SIZE + signature.len() + username.len();
    let mut buf = Vec::with_capacity(length + payload.len());
    PartHeader {
        part_type: parts::SIGNATURE,
        length: u16::try_from(length).expect("username too long"),
    }
    .write_to(&mut buf);
    buf.extend_from_slice(&signature);
    buf.extend_from_slice(username.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Wraps `payload` in an encryption part using AES-256-OFB keyed with SHA-256 of the secret.
pub fn encrypt(username: &str, secret: &str, iv: [u8; 16], payload: &[u8]) -> Vec<u8> {
    let key = Sha256::digest(secret.as_bytes());

    let mut ciphertext = Sha1::digest(payload).to_vec();
    ciphertext.extend_from_slice(payload);
    let mut cipher = Ofb::<Aes256>::new_from_slices(&key, &iv).expect("valid key and IV sizes");
    cipher.apply_keystream(&mut ciphertext);

    let length = parts::HEADER_SIZE + 2 + username.len() + iv.len() + ciphertext.len();
    let mut buf = Vec::with_capacity(length);
    PartHeader {
        part_type: parts::ENCRYPTION,
        length: u16::try_from(length).expect("payload too large"),
    }
    .write_to(&mut buf);
    let username_len = u16::try_from(username.len()).expect("username too long");
    buf.extend_from_slice(&username_len.to_be_bytes());
    buf.extend_from_slice(username.as_bytes());
    buf.extend_from_slice(&iv);
    buf.extend_from_slice(&ciphertext);
    buf
}
