use csv::ByteRecord;

use crate::error::PrecacheError;
use crate::gtfs::Field;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn is_padding(byte: &u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'"' | b'\r' | b'\n')
}

/// Strips surrounding quotes, blanks and line endings from a raw field.
pub fn clean_field(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !is_padding(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !is_padding(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Physical column position of every required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    positions: [usize; 5],
}

impl ColumnMap {
    pub fn resolve(header: &ByteRecord) -> Result<Self, PrecacheError> {
        let mut positions: [Option<usize>; 5] = [None; 5];

        for (column, raw) in header.iter().enumerate() {
            let raw = if column == 0 {
                raw.strip_prefix(UTF8_BOM).unwrap_or(raw)
            } else {
                raw
            };
            let Some(field) = std::str::from_utf8(clean_field(raw))
                .ok()
                .and_then(Field::from_name)
            else {
                continue;
            };
            positions[field.index()].get_or_insert(column);
        }

        let missing: Vec<Field> = Field::ALL
            .into_iter()
            .filter(|field| positions[field.index()].is_none())
            .collect();
        if !missing.is_empty() {
            return Err(PrecacheError::HeaderFormat { missing });
        }

        Ok(Self {
            positions: positions.map(|position| position.unwrap_or_default()),
        })
    }

    pub fn position(&self, field: Field) -> usize {
        self.positions[field.index()]
    }
}
