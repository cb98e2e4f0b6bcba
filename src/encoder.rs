use std::io::Write;

use crate::error::EncodeError;
use crate::gtfs::{Document, ScheduleRow, DOCUMENT_KEY};

/// Streams a `{"stop_times": [...]}` MessagePack document whose array length
/// is fixed when the encoder is created.
#[derive(Debug)]
pub struct DocumentEncoder<W: Write> {
    writer: W,
    declared: u64,
    written: u64,
}

impl<W: Write> DocumentEncoder<W> {
    pub fn begin(mut writer: W, rows: u64) -> Result<Self, EncodeError> {
        let len = u32::try_from(rows).map_err(|_| EncodeError::TooManyRows(rows))?;

        rmp::encode::write_map_len(&mut writer, 1)?;
        rmp::encode::write_str(&mut writer, DOCUMENT_KEY)?;
        rmp::encode::write_array_len(&mut writer, len)?;

        Ok(Self {
            writer,
            declared: rows,
            written: 0,
        })
    }

    pub fn push(&mut self, row: &ScheduleRow) -> Result<(), EncodeError> {
        if self.written == self.declared {
            return Err(EncodeError::LengthMismatch {
                declared: self.declared,
                written: self.written + 1,
            });
        }
        rmp_serde::encode::write_named(&mut self.writer, row)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> Result<W, EncodeError> {
        if self.written != self.declared {
            return Err(EncodeError::LengthMismatch {
                declared: self.declared,
                written: self.written,
            });
        }
        Ok(self.writer)
    }
}

pub fn decode_document(bytes: &[u8]) -> Result<Document, EncodeError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
