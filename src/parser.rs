use std::fs::File;
use std::io::Read;
use std::num::IntErrorKind;
use std::path::Path;

use csv::{ByteRecord, Reader, ReaderBuilder};

use crate::columns::{clean_field, ColumnMap};
use crate::error::{PrecacheError, RowError, SequenceReason};
use crate::gtfs::{BoundedString, Field, ScheduleRow};

/// Opens a schedule file for one pass.
pub fn open_schedule(path: &Path) -> Result<Reader<File>, PrecacheError> {
    let file = File::open(path).map_err(|err| PrecacheError::file_access(path, err))?;
    Ok(schedule_reader(file))
}

/// One record per line, split on every comma. Quote characters are left in
/// the fields for `clean_field` to trim, so a stray quote can't join lines.
/// Records may have any number of fields and blank lines are skipped.
pub fn schedule_reader<R: Read>(source: R) -> Reader<R> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(source)
}

/// Counters for one pass over the data rows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParserState {
    pub rows: u64,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct RowParser {
    columns: ColumnMap,
    state: ParserState,
}

impl RowParser {
    pub fn new(columns: ColumnMap) -> Self {
        Self {
            columns,
            state: ParserState::default(),
        }
    }

    pub fn parse(&mut self, record: &ByteRecord) -> Result<ScheduleRow, RowError> {
        self.state.rows += 1;
        let result = parse_row(record, &self.columns);
        match result {
            Ok(_) => self.state.accepted += 1,
            Err(_) => self.state.rejected += 1,
        }
        result
    }

    pub fn state(&self) -> ParserState {
        self.state
    }
}

pub fn parse_row(record: &ByteRecord, columns: &ColumnMap) -> Result<ScheduleRow, RowError> {
    Ok(ScheduleRow {
        trip_id: text_field(record, columns, Field::TripId, true)?,
        stop_id: text_field(record, columns, Field::StopId, true)?,
        arrival_time: text_field(record, columns, Field::ArrivalTime, false)?,
        departure_time: text_field(record, columns, Field::DepartureTime, false)?,
        stop_sequence: parse_sequence(raw_field(record, columns, Field::StopSequence)?)?,
    })
}

fn raw_field<'r>(
    record: &'r ByteRecord,
    columns: &ColumnMap,
    field: Field,
) -> Result<&'r str, RowError> {
    let raw = record
        .get(columns.position(field))
        .ok_or(RowError::MissingField(field))?;
    std::str::from_utf8(clean_field(raw)).map_err(|_| RowError::InvalidUtf8(field))
}

// Times may be blank on non-timepoint stops; identifiers may not.
fn text_field<const MAX: usize>(
    record: &ByteRecord,
    columns: &ColumnMap,
    field: Field,
    required: bool,
) -> Result<BoundedString<MAX>, RowError> {
    let value = raw_field(record, columns, field)?;
    if required && value.is_empty() {
        return Err(RowError::MissingField(field));
    }
    BoundedString::new(value).map_err(|err| RowError::FieldTooLong {
        field,
        len: err.len,
        max: err.max,
    })
}

fn parse_sequence(value: &str) -> Result<i32, RowError> {
    let invalid = |reason| RowError::SequenceFormat {
        value: value.to_owned(),
        reason,
    };

    match value.parse::<i32>() {
        Ok(sequence) if sequence < 0 => Err(invalid(SequenceReason::Negative)),
        Ok(sequence) => Ok(sequence),
        Err(err) => match err.kind() {
            IntErrorKind::Empty => Err(RowError::MissingField(Field::StopSequence)),
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                Err(invalid(SequenceReason::OutOfRange))
            }
            _ => Err(invalid(SequenceReason::NotNumeric)),
        },
    }
}
