//! Payload model and fingerprinting.
//!
//! A payload is one line of newline-delimited JSON: the raw text, where it
//! came from (file + 1-based line number), and a blake3 digest of the raw
//! bytes. Payloads are never mutated after being read; the digest is the key
//! into the per-resource change-log.

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Change-log key: blake3 digest of the raw payload bytes.
pub type Fingerprint = [u8; 32];

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no value at `{0}`")]
    MissingField(String),

    #[error("value at `{0}` is not a scalar")]
    NotScalar(String),
}

pub type PayloadResult<T> = Result<T, PayloadError>;

/// One record read from a local data file.
#[derive(Debug, Clone)]
pub struct Payload {
    pub file: PathBuf,
    pub line: usize,
    pub data: String,
    pub fingerprint: Fingerprint,
}

impl Payload {
    pub fn new(file: PathBuf, line: usize, data: String) -> Self {
        let fingerprint = fingerprint(&data);
        Self {
            file,
            line,
            data,
            fingerprint,
        }
    }

    /// Lossy display form of the source file, for log lines and failure keys.
    pub fn file_name(&self) -> String {
        self.file.display().to_string()
    }
}

/// Computes the fingerprint for a raw payload line.
pub fn fingerprint(data: &str) -> Fingerprint {
    *blake3::hash(data.as_bytes()).as_bytes()
}

/// Hex form, used for cache file names.
pub fn fingerprint_hex(data: &str) -> String {
    hex::encode(fingerprint(data))
}

/// Walks a dotted path (`assessmentReference.namespace`) into a parsed JSON
/// value. Array segments are not supported; a missing segment is an error,
/// never a silent null.
pub fn lookup_path<'a>(value: &'a Value, dotted: &str) -> PayloadResult<&'a Value> {
    let mut current = value;
    for segment in dotted.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| PayloadError::MissingField(dotted.to_string()))?;
    }
    Ok(current)
}

/// Fills out a field map (field name -> dotted path) against a payload body,
/// producing query-parameter values. Used to search for a record by its
/// identity fields before deleting it, and for uniqueness checks.
pub fn interpolate_params(
    structure: &BTreeMap<String, String>,
    payload: &Value,
) -> PayloadResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for (name, path) in structure {
        let value = lookup_path(payload, path)?;
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(PayloadError::NotScalar(path.clone())),
        };
        params.insert(name.clone(), rendered);
    }
    Ok(params)
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Collapses runs of whitespace so multi-line API error bodies fit on one
/// log line.
pub fn linearize(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}
