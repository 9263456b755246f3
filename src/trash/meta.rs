//! Trash sidecar metadata: plain-text key:value lines closed by an
//! HMAC-SHA256 signature over everything above it.
//!
//! Verification is fail-closed: a missing or invalid signature makes the
//! entry unrestorable, never silently restorable.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::core::errors::{Result, SageError};

type HmacSha256 = Hmac<Sha256>;

/// Parsed sidecar contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrashMeta {
    pub original_path: PathBuf,
    pub trashed_at: DateTime<Utc>,
    pub size: u64,
    /// Unix permission bits, octal.
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
}

impl TrashMeta {
    /// Serialize to the signed on-disk representation.
    pub fn to_signed_string(&self, key: &[u8]) -> String {
        let body = self.body();
        let signature = sign(key, body.as_bytes());
        format!("{body}signature: {signature}\n")
    }

    fn body(&self) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "original_path: {}", self.original_path.display());
        let _ = writeln!(
            body,
            "trashed_at: {}",
            self.trashed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let _ = writeln!(body, "size: {}", self.size);
        let _ = writeln!(body, "mode: {:o}", self.mode);
        let _ = writeln!(
            body,
            "mod_time: {}",
            self.mod_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        body
    }

    /// Parse and verify a signed sidecar. Signature comparison is
    /// constant-time; any mismatch is reported as tampering.
    pub fn parse_verified(raw: &str, key: &[u8], meta_path: &Path) -> Result<Self> {
        let tampering = |details: &str| SageError::Tampering {
            path: meta_path.to_path_buf(),
            details: details.to_string(),
        };

        let Some(sig_start) = raw.rfind("signature: ") else {
            return Err(tampering("signature line missing"));
        };
        let body = &raw[..sig_start];
        let sig_hex = raw[sig_start + "signature: ".len()..].trim();
        let sig_bytes = decode_hex(sig_hex).ok_or_else(|| tampering("signature is not hex"))?;

        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|_| tampering("signing key rejected"))?;
        mac.update(body.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| tampering("signature mismatch"))?;

        Self::parse_body(body).map_err(|details| tampering(&details))
    }

    fn parse_body(body: &str) -> std::result::Result<Self, String> {
        let mut original_path = None;
        let mut trashed_at = None;
        let mut size = None;
        let mut mode = None;
        let mut mod_time = None;

        for line in body.lines() {
            let Some((field, value)) = line.split_once(": ") else {
                continue;
            };
            match field {
                "original_path" => original_path = Some(PathBuf::from(value)),
                "trashed_at" => {
                    trashed_at = Some(parse_rfc3339(value).ok_or("bad trashed_at")?);
                }
                "size" => size = Some(value.parse::<u64>().map_err(|_| "bad size")?),
                "mode" => {
                    mode = Some(u32::from_str_radix(value, 8).map_err(|_| "bad mode")?);
                }
                "mod_time" => {
                    mod_time = Some(parse_rfc3339(value).ok_or("bad mod_time")?);
                }
                _ => {}
            }
        }

        Ok(Self {
            original_path: original_path.ok_or("original_path missing")?,
            trashed_at: trashed_at.ok_or("trashed_at missing")?,
            size: size.ok_or("size missing")?,
            mode: mode.ok_or("mode missing")?,
            mod_time: mod_time.ok_or("mod_time missing")?,
        })
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn sign(key: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(body);
    encode_hex(&mac.finalize().into_bytes())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}
