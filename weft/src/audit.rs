//! Append-only, HMAC-chained audit log.
//!
//! One JSON object per line. Each line carries `prev_hash`, the HMAC-SHA256
//! of the canonical serialization (sorted keys, compact separators) of the
//! *previous* line minus its own `prev_hash` field; the first line chains
//! from the empty hash. Verification recomputes the chain offline.

use std::io::Write;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use weft_core::WeftError;

type HmacSha256 = Hmac<Sha256>;

/// Canonical bytes of an event: sorted keys, compact separators, with any
/// `prev_hash` field excluded.
fn canonical_bytes(event: &serde_json::Value) -> Result<Vec<u8>, WeftError> {
    let mut event = event.clone();
    if let Some(map) = event.as_object_mut() {
        map.remove("prev_hash");
    }
    // serde_json maps are ordered by key, so this is already canonical.
    serde_json::to_vec(&event).map_err(WeftError::from)
}

fn mac_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Append-only audit log writer. Single appender per file; chain
/// verification is done offline via [`verify_chain`].
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    secret: Vec<u8>,
    last_hash: Option<String>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, continuing an existing chain.
    ///
    /// # Errors
    /// Returns `WeftError::Snapshot` when an existing file cannot be read
    /// or its final line cannot be parsed.
    pub fn open(path: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> Result<Self, WeftError> {
        let path = path.into();
        let secret = secret.into();
        let last_hash = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let mut last = None;
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let event: serde_json::Value = serde_json::from_str(line)
                        .map_err(|e| WeftError::snapshot(format!("corrupt audit line: {e}")))?;
                    last = Some(mac_hex(&secret, &canonical_bytes(&event)?));
                }
                last
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(WeftError::snapshot(err.to_string())),
        };
        Ok(Self {
            path,
            secret,
            last_hash,
        })
    }

    /// Append an event, chaining it to the previous line.
    ///
    /// The event must serialize to a JSON object; `prev_hash` is set by the
    /// log (empty string for the first line).
    ///
    /// # Errors
    /// Returns `WeftError::Snapshot` on serialization or write failure.
    pub fn append_event(&mut self, event: serde_json::Value) -> Result<String, WeftError> {
        let mut event = event;
        let map = event
            .as_object_mut()
            .ok_or_else(|| WeftError::snapshot("audit event must be a JSON object"))?;
        map.insert(
            "prev_hash".to_string(),
            serde_json::Value::String(self.last_hash.clone().unwrap_or_default()),
        );

        let line_hash = mac_hex(&self.secret, &canonical_bytes(&event)?);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WeftError::snapshot(e.to_string()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WeftError::snapshot(e.to_string()))?;
        let line =
            serde_json::to_string(&event).map_err(|e| WeftError::snapshot(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| WeftError::snapshot(e.to_string()))?;

        self.last_hash = Some(line_hash.clone());
        Ok(line_hash)
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Verify the HMAC chain of a log file.
///
/// Each line's `prev_hash` must equal the HMAC of the previous line's
/// canonical serialization; the first line must chain from the empty
/// string. Returns the terminal hash on success.
///
/// # Errors
/// `WeftError::Validation` pinpointing the first line whose chain breaks;
/// `WeftError::Snapshot` for unreadable files.
pub fn verify_chain(path: &Path, secret: &[u8]) -> Result<Option<String>, WeftError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(WeftError::snapshot(err.to_string())),
    };

    let mut expected_prev = String::new();
    let mut last_hash = None;
    for (idx, line) in contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
    {
        let event: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| WeftError::validation(format!("audit line {idx} unparsable: {e}")))?;
        let recorded_prev = event
            .get("prev_hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                WeftError::validation(format!("audit line {idx} missing prev_hash"))
            })?;
        if recorded_prev != expected_prev {
            return Err(WeftError::validation(format!(
                "audit chain broken at line {idx}"
            )));
        }
        let hash = mac_hex(secret, &canonical_bytes(&event)?);
        expected_prev = hash.clone();
        last_hash = Some(hash);
    }
    Ok(last_hash)
}
