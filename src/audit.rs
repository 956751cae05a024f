// =============================================================================
// Audit log — append-only, hash-chained JSON lines
// =============================================================================
//
// Each line is one JSON object: timestamp, event_type, actor, action,
// details, previous_hash, event_hash. `event_hash` is the SHA-256 of the
// canonical (sorted-key, compact) JSON serialisation of the record without
// the event_hash field; `previous_hash` chains to the prior line. Genesis
// previous_hash is 64 zeros. `verify_chain` recomputes the whole chain.
// =============================================================================

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Hash value used for the first record's `previous_hash`.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One parsed audit record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub event_type: String,
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
    pub previous_hash: String,
    pub event_hash: String,
}

/// Append-only audit writer. Appends are serialised under a mutex so
/// concurrent tasks cannot interleave lines or fork the chain.
pub struct AuditLog {
    inner: Mutex<Inner>,
    path: PathBuf,
}

struct Inner {
    file: File,
    last_hash: String,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`, resuming the hash chain
    /// from the last existing record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let last_hash = match read_records(&path) {
            Ok(records) => records
                .last()
                .map(|r| r.event_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            Err(_) => GENESIS_HASH.to_string(),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open audit log at {}", path.display()))?;

        Ok(Self {
            inner: Mutex::new(Inner { file, last_hash }),
            path,
        })
    }

    /// Append one event and return its hash.
    pub fn record(
        &self,
        event_type: &str,
        actor: &str,
        action: &str,
        details: serde_json::Value,
    ) -> Result<String> {
        let mut inner = self.inner.lock();

        let mut fields = BTreeMap::new();
        fields.insert("timestamp", serde_json::json!(Utc::now().to_rfc3339()));
        fields.insert("event_type", serde_json::json!(event_type));
        fields.insert("actor", serde_json::json!(actor));
        fields.insert("action", serde_json::json!(action));
        fields.insert("details", details);
        fields.insert("previous_hash", serde_json::json!(inner.last_hash.clone()));

        let event_hash = hash_fields(&fields)?;
        fields.insert("event_hash", serde_json::json!(event_hash.clone()));

        let line = serde_json::to_string(&fields).context("failed to serialise audit record")?;
        writeln!(inner.file, "{line}").with_context(|| {
            format!("failed to append audit record to {}", self.path.display())
        })?;
        inner.file.flush().ok();

        inner.last_hash = event_hash.clone();
        Ok(event_hash)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Canonical hash of a record's fields (sorted keys, compact separators,
/// `event_hash` excluded).
fn hash_fields(fields: &BTreeMap<&str, serde_json::Value>) -> Result<String> {
    let canonical =
        serde_json::to_string(fields).context("failed to canonicalise audit record")?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Read and parse every record in the file. Missing file yields an empty
/// chain.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
    );
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(&line)
            .with_context(|| format!("malformed audit record on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Recompute the whole chain. Returns true iff every `event_hash` matches
/// the recomputed hash and every `previous_hash` equals the prior record's
/// `event_hash` (genesis for the first).
pub fn verify_chain(path: impl AsRef<Path>) -> Result<bool> {
    let records = read_records(path)?;
    let mut expected_prev = GENESIS_HASH.to_string();

    for record in &records {
        if record.previous_hash != expected_prev {
            return Ok(false);
        }
        let mut fields = BTreeMap::new();
        fields.insert("timestamp", serde_json::json!(record.timestamp));
        fields.insert("event_type", serde_json::json!(record.event_type));
        fields.insert("actor", serde_json::json!(record.actor));
        fields.insert("action", serde_json::json!(record.action));
        fields.insert("details", record.details.clone());
        fields.insert("previous_hash", serde_json::json!(record.previous_hash));
        let recomputed = hash_fields(&fields)?;
        if recomputed != record.event_hash {
            return Ok(false);
        }
        expected_prev = record.event_hash.clone();
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_verifies_after_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let log = AuditLog::open(&path).unwrap();
        log.record("startup", "bot", "connect", serde_json::json!({"exchange": "binance"}))
            .unwrap();
        log.record("order", "grid", "place", serde_json::json!({"symbol": "BTC/USDT"}))
            .unwrap();
        log.record("shutdown", "bot", "stop", serde_json::json!({}))
            .unwrap();

        assert!(verify_chain(&path).unwrap());
        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].previous_hash, GENESIS_HASH);
        assert_eq!(records[1].previous_hash, records[0].event_hash);
    }

    #[test]
    fn tampering_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let log = AuditLog::open(&path).unwrap();
        log.record("order", "grid", "place", serde_json::json!({"price": "40000"}))
            .unwrap();
        log.record("order", "grid", "cancel", serde_json::json!({"price": "41000"}))
            .unwrap();

        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("40000", "99999");
        std::fs::write(&path, tampered).unwrap();

        assert!(!verify_chain(&path).unwrap());
    }

    #[test]
    fn chain_resumes_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        {
            let log = AuditLog::open(&path).unwrap();
            log.record("startup", "bot", "connect", serde_json::json!({})).unwrap();
        }
        {
            let log = AuditLog::open(&path).unwrap();
            log.record("shutdown", "bot", "stop", serde_json::json!({})).unwrap();
        }

        assert!(verify_chain(&path).unwrap());
        let records = read_records(&path).unwrap();
        assert_eq!(records[1].previous_hash, records[0].event_hash);
    }

    #[test]
    fn empty_chain_verifies() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_chain(dir.path().join("missing.log")).unwrap());
    }
}
