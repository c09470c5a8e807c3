//! Compact textual encoding of the queue's durable state.
//!
//! Each entry becomes `name|finished|base64(output)`; records are joined
//! with `;`. The output is base64-encoded so it may contain the separators.
//! Names are written verbatim.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::warn;

use crate::models::error::CorruptStateError;

const RECORD_SEPARATOR: char = ';';
const FIELD_SEPARATOR: char = '|';

/// The durable part of one queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEntry {
    pub name: String,
    pub finished: bool,
    pub output: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub entries: Vec<PersistedEntry>,
    pub skipped: Vec<CorruptStateError>,
}

pub fn encode<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = &'a PersistedEntry>,
{
    entries
        .into_iter()
        .map(|entry| {
            format!(
                "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}",
                entry.name,
                entry.finished,
                STANDARD.encode(entry.output.as_bytes())
            )
        })
        .collect::<Vec<_>>()
        .join(&RECORD_SEPARATOR.to_string())
}

/// Decodes a blob produced by [`encode`]. Malformed records are skipped
/// and reported; the rest of the queue still loads.
pub fn decode(blob: &str) -> Decoded {
    let mut decoded = Decoded::default();
    for (index, record) in blob.split(RECORD_SEPARATOR).enumerate() {
        if record.is_empty() {
            continue;
        }
        match decode_record(index, record) {
            Ok(entry) => decoded.entries.push(entry),
            Err(e) => {
                warn!("Skipping persisted queue record: {}", e);
                decoded.skipped.push(e);
            }
        }
    }
    decoded
}

fn decode_record(index: usize, record: &str) -> Result<PersistedEntry, CorruptStateError> {
    let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
    let [name, finished, output] = fields[..] else {
        return Err(CorruptStateError::FieldCount {
            index,
            found: fields.len(),
        });
    };

    let bytes = STANDARD
        .decode(output)
        .map_err(|e| CorruptStateError::Base64 {
            index,
            reason: e.to_string(),
        })?;
    let output = String::from_utf8(bytes).map_err(|_| CorruptStateError::Utf8 { index })?;

    Ok(PersistedEntry {
        name: name.to_string(),
        finished: finished.eq_ignore_ascii_case("true"),
        output,
    })
}
