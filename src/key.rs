//! Key extractor (§4.2) — pure, stateless per-record key extraction.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FormatError {
    #[error("record is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("JSON field {field:?} is missing or not a string")]
    MissingJsonField { field: String },
    #[error("CSV record has fewer than {needed} columns (delimiter {delimiter:?})")]
    MissingCsvColumn { needed: usize, delimiter: char },
    #[error("key contains a disallowed byte (TAB or newline)")]
    DisallowedKeyByte,
}

/// Record-format descriptor, configured once per repack/index run (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFormat {
    Json { field: String },
    Csv { column: usize, delimiter: u8 },
    Raw,
}

impl KeyFormat {
    pub fn json(field: impl Into<String>) -> Self {
        KeyFormat::Json { field: field.into() }
    }

    pub fn csv(column: usize, delimiter: u8) -> Self {
        KeyFormat::Csv { column, delimiter }
    }
}

/// Extract the key bytes from one newline-stripped record line.
///
/// The index format forbids TAB and newline inside keys (§6); this is
/// enforced here, uniformly across all three formats, rather than only at
/// the index-codec boundary, so a bad key is reported against the record
/// that produced it.
pub fn extract_key(line: &[u8], format: &KeyFormat) -> Result<Vec<u8>, FormatError> {
    let key = match format {
        KeyFormat::Raw => line.to_vec(),
        KeyFormat::Json { field } => extract_json_field(line, field)?,
        KeyFormat::Csv { column, delimiter } => extract_csv_column(line, *column, *delimiter)?,
    };
    if key.iter().any(|&b| b == b'\t' || b == b'\n') {
        return Err(FormatError::DisallowedKeyByte);
    }
    Ok(key)
}

fn extract_json_field(line: &[u8], field: &str) -> Result<Vec<u8>, FormatError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| FormatError::InvalidJson(e.to_string()))?;
    match value.get(field).and_then(Value::as_str) {
        Some(s) => Ok(s.as_bytes().to_vec()),
        None => Err(FormatError::MissingJsonField { field: field.to_string() }),
    }
}

fn extract_csv_column(line: &[u8], column: usize, delimiter: u8) -> Result<Vec<u8>, FormatError> {
    // No quoting, per spec.md §4.2 — a plain byte split suffices.
    let mut start = 0usize;
    let mut current = 0usize;
    for (i, &b) in line.iter().enumerate() {
        if b == delimiter {
            if current == column {
                return Ok(line[start..i].to_vec());
            }
            current += 1;
            start = i + 1;
        }
    }
    if current == column {
        return Ok(line[start..].to_vec());
    }
    Err(FormatError::MissingCsvColumn {
        needed: column + 1,
        delimiter: delimiter as char,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_field_extraction() {
        let line = br#"{"id":"b","v":1}"#;
        let key = extract_key(line, &KeyFormat::json("id")).unwrap();
        assert_eq!(key, b"b");
    }

    #[test]
    fn json_missing_field_fails() {
        let line = br#"{"v":1}"#;
        let err = extract_key(line, &KeyFormat::json("id")).unwrap_err();
        assert_eq!(
            err,
            FormatError::MissingJsonField { field: "id".to_string() }
        );
    }

    #[test]
    fn json_non_string_field_fails() {
        let line = br#"{"id":1}"#;
        assert!(extract_key(line, &KeyFormat::json("id")).is_err());
    }

    #[test]
    fn csv_column_extraction() {
        let line = b"b,1";
        let key = extract_key(line, &KeyFormat::csv(0, b',')).unwrap();
        assert_eq!(key, b"b");
        let key = extract_key(line, &KeyFormat::csv(1, b',')).unwrap();
        assert_eq!(key, b"1");
    }

    #[test]
    fn csv_missing_column_fails() {
        let line = b"onlyone";
        assert!(extract_key(line, &KeyFormat::csv(1, b',')).is_err());
    }

    #[test]
    fn raw_format_is_whole_line() {
        let line = b"whatever bytes";
        assert_eq!(extract_key(line, &KeyFormat::Raw).unwrap(), line);
    }

    #[test]
    fn tab_in_key_is_rejected() {
        let line = b"has\ttab,x";
        assert!(extract_key(line, &KeyFormat::csv(0, b',')).is_err());
    }
}
