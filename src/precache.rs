use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::time::{Duration, Instant};

use csv::{ByteRecord, Reader};
use tempfile::NamedTempFile;

use crate::columns::ColumnMap;
use crate::config::Config;
use crate::encoder::{decode_document, DocumentEncoder};
use crate::error::{EncodeError, PrecacheError, RowError};
use crate::gtfs::Field;
use crate::limiter::{CpuLimiter, ProcessClock, ProportionalThrottle, SystemClock, Throttle};
use crate::parser::{open_schedule, RowParser};
use crate::progress::{format_size, ProgressMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub total_rows: u64,
    pub accepted_rows: u64,
}

/// A data row left out of the document, by its line in the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub line: u64,
    pub error: RowError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSummary {
    pub output_bytes: u64,
    pub skipped: Vec<SkippedRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total_rows: u64,
    pub accepted_rows: u64,
    pub skipped_rows: u64,
    pub skipped: Vec<SkippedRow>,
    pub output_bytes: u64,
    pub elapsed: Duration,
    pub throttled: Duration,
}

/// Converts `config.input` into a MessagePack document at `config.output`.
///
/// The first pass parses every row to learn how many will be accepted, so the
/// document can declare its exact array length before the second pass
/// streams the rows out. Output goes to a temporary file beside the target
/// and only replaces it once complete.
pub fn run(config: &Config) -> Result<RunSummary, PrecacheError> {
    config.validate()?;
    let start = Instant::now();
    let throttle = ProportionalThrottle::new(config.ceiling());
    log::debug!("CPU ceiling {:.0}% of one core", throttle.ceiling() * 100.0);
    let mut limiter = CpuLimiter::new(SystemClock::default(), throttle, config.check_interval);

    log::info!("Counting rows in {}", config.input.display());
    let counts = scan(&config.input, &mut limiter)?;
    log::info!(
        "Total rows to process: {} ({} valid)",
        counts.total_rows,
        counts.accepted_rows
    );

    let mut monitor =
        ProgressMonitor::new(counts.total_rows, config.sample_interval, config.show_progress);
    let encoded = encode(&config.input, &config.output, counts, &mut limiter, &mut monitor)?;
    let last = monitor.finish();

    if config.verify {
        verify(&config.output, counts.accepted_rows)?;
    }

    let summary = RunSummary {
        total_rows: counts.total_rows,
        accepted_rows: counts.accepted_rows,
        skipped_rows: counts.total_rows - counts.accepted_rows,
        skipped: encoded.skipped,
        output_bytes: encoded.output_bytes,
        elapsed: start.elapsed(),
        throttled: limiter.throttled(),
    };
    log::info!(
        "Completed processing {} rows: {} encoded, {} skipped, {} written in {:.1?} ({:.1?} throttled, {:.0} rows/s)",
        summary.total_rows,
        summary.accepted_rows,
        summary.skipped_rows,
        format_size(summary.output_bytes),
        summary.elapsed,
        summary.throttled,
        last.rows_per_second,
    );
    Ok(summary)
}

pub fn scan(
    input: &Path,
    limiter: &mut CpuLimiter<impl ProcessClock, impl Throttle>,
) -> Result<ScanSummary, PrecacheError> {
    let mut reader = open_schedule(input)?;
    let mut parser = RowParser::new(read_header(&mut reader, input)?);

    let mut record = ByteRecord::new();
    while read_record(&mut reader, &mut record, input)? {
        limiter.tick();
        // Rejections are reported by the encode pass.
        let _ = parser.parse(&record);
    }

    let state = parser.state();
    log::debug!("Count pass: {} rows, {} rejected", state.rows, state.rejected);
    Ok(ScanSummary {
        total_rows: state.rows,
        accepted_rows: state.accepted,
    })
}

/// Second pass: writes exactly `scan.accepted_rows` rows. Every rejected row
/// is logged as a warning and returned with the size of the document.
pub fn encode(
    input: &Path,
    output: &Path,
    scan: ScanSummary,
    limiter: &mut CpuLimiter<impl ProcessClock, impl Throttle>,
    monitor: &mut ProgressMonitor,
) -> Result<EncodeSummary, PrecacheError> {
    let mut reader = open_schedule(input)?;
    let mut parser = RowParser::new(read_header(&mut reader, input)?);

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir).map_err(|err| PrecacheError::file_access(output, err))?;
    let mut encoder = DocumentEncoder::begin(BufWriter::new(temp), scan.accepted_rows)?;

    let mut skipped = Vec::new();
    let mut record = ByteRecord::new();
    while read_record(&mut reader, &mut record, input)? {
        limiter.tick();
        match parser.parse(&record) {
            Ok(row) => {
                if encoder.written() == scan.accepted_rows {
                    return Err(input_changed(scan, parser.state().accepted));
                }
                encoder.push(&row)?;
            }
            Err(error) => {
                let line = record.position().map_or(0, |position| position.line());
                monitor.suspend(|| log::warn!("Skipping line {line}: {error}"));
                skipped.push(SkippedRow { line, error });
            }
        }
        monitor.advance();
    }

    let accepted = parser.state().accepted;
    if accepted != scan.accepted_rows {
        return Err(input_changed(scan, accepted));
    }

    let temp = encoder
        .finish()?
        .into_inner()
        .map_err(|err| PrecacheError::file_access(output, err.into_error()))?;
    let file = temp
        .persist(output)
        .map_err(|err| PrecacheError::file_access(output, err.error))?;
    let metadata = file
        .metadata()
        .map_err(|err| PrecacheError::file_access(output, err))?;
    Ok(EncodeSummary {
        output_bytes: metadata.len(),
        skipped,
    })
}

pub fn verify(output: &Path, expected_rows: u64) -> Result<(), PrecacheError> {
    let bytes = fs::read(output).map_err(|err| PrecacheError::file_access(output, err))?;
    let document = decode_document(&bytes)?;
    let rows = document.stop_times.len() as u64;
    if rows != expected_rows {
        return Err(EncodeError::LengthMismatch {
            declared: expected_rows,
            written: rows,
        }
        .into());
    }
    log::info!("Verified {} rows in {}", rows, output.display());
    Ok(())
}

fn input_changed(scan: ScanSummary, written: u64) -> PrecacheError {
    PrecacheError::InputChanged {
        declared: scan.accepted_rows,
        written,
    }
}

fn read_record(
    reader: &mut Reader<File>,
    record: &mut ByteRecord,
    path: &Path,
) -> Result<bool, PrecacheError> {
    reader
        .read_byte_record(record)
        .map_err(|err| PrecacheError::file_access(path, err.into()))
}

fn read_header(reader: &mut Reader<File>, path: &Path) -> Result<ColumnMap, PrecacheError> {
    let mut header = ByteRecord::new();
    if !read_record(reader, &mut header, path)? {
        return Err(PrecacheError::HeaderFormat {
            missing: Field::ALL.to_vec(),
        });
    }
    ColumnMap::resolve(&header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SequenceReason;
    use crate::gtfs::{Document, IdString, ScheduleRow, TimeString};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const HEADER: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n";

    fn fixture(contents: &str) -> (TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("stop_times.txt");
        fs::write(&input, contents).unwrap();

        let mut config = Config::new(input, dir.path().join("stop_times.msgpack"));
        config.cpu_limit = 100;
        config.show_progress = false;
        (dir, config)
    }

    fn decode(path: &Path) -> Document {
        decode_document(&fs::read(path).unwrap()).unwrap()
    }

    fn rows(count: usize) -> String {
        let mut contents = HEADER.to_owned();
        for i in 0..count {
            contents.push_str(&format!("T{},08:{:02}:00,08:{:02}:30,S{},{}\n", i / 10, i % 60, i % 60, i, i % 10));
        }
        contents
    }

    #[test]
    fn worked_example() {
        let (_dir, config) = fixture(
            "\"trip_id\",\"arrival_time\",\"departure_time\",\"stop_id\",\"stop_sequence\"\n\
             \"T1\",\"08:00:00\",\"08:00:30\",\"S1\",\"3\"\n",
        );

        let summary = run(&config).unwrap();

        assert_eq!(summary.total_rows, 1);
        assert_eq!(summary.skipped_rows, 0);
        assert_eq!(
            decode(&config.output),
            Document {
                stop_times: vec![ScheduleRow {
                    trip_id: IdString::new("T1").unwrap(),
                    stop_id: IdString::new("S1").unwrap(),
                    arrival_time: TimeString::new("08:00:00").unwrap(),
                    departure_time: TimeString::new("08:00:30").unwrap(),
                    stop_sequence: 3,
                }]
            }
        );
        assert_eq!(summary.output_bytes, fs::metadata(&config.output).unwrap().len());
    }

    #[test]
    fn every_row_survives() {
        let (_dir, config) = fixture(&rows(250));
        let summary = run(&config).unwrap();

        let document = decode(&config.output);
        assert_eq!(summary.accepted_rows, 250);
        assert_eq!(document.stop_times.len(), 250);
        assert_eq!(document.stop_times[123].stop_id.as_str(), "S123");
        assert_eq!(document.stop_times[123].trip_id.as_str(), "T12");
        assert_eq!(document.stop_times[123].stop_sequence, 3);
    }

    #[test]
    fn bad_sequences_are_skipped() {
        for bad in ["-1", "abc"] {
            let contents = format!(
                "{HEADER}T1,08:00:00,08:00:00,S1,1\nT1,08:05:00,08:05:00,S2,{bad}\nT1,08:10:00,08:10:00,S3,3\n"
            );
            let (_dir, config) = fixture(&contents);

            let summary = run(&config).unwrap();

            assert_eq!(summary.total_rows, 3);
            assert_eq!(summary.skipped_rows, 1);
            assert_eq!(summary.skipped.len(), 1);
            assert_eq!(summary.skipped[0].line, 3);
            assert!(matches!(
                &summary.skipped[0].error,
                RowError::SequenceFormat { value, .. } if value == bad
            ));
            let stops: Vec<_> = decode(&config.output)
                .stop_times
                .iter()
                .map(|row| row.stop_id.to_string())
                .collect();
            assert_eq!(stops, ["S1", "S3"]);
        }
    }

    #[test]
    fn skipped_rows_report_line_and_reason() {
        let contents = format!(
            "{HEADER}T1,08:00:00,08:00:00,S1,1\n\
             T2,08:01:00,08:01:00,S2\n\
             T3,08:02:00,08:02:00,S3,-4\n\
             T4,08:03:00,08:03:00,S4,4\n"
        );
        let (_dir, config) = fixture(&contents);

        let summary = run(&config).unwrap();

        assert_eq!(
            summary.skipped,
            vec![
                SkippedRow {
                    line: 3,
                    error: RowError::MissingField(Field::StopSequence),
                },
                SkippedRow {
                    line: 4,
                    error: RowError::SequenceFormat {
                        value: "-4".to_owned(),
                        reason: SequenceReason::Negative,
                    },
                },
            ]
        );
        assert_eq!(summary.skipped_rows, 2);
        assert_eq!(decode(&config.output).stop_times.len(), 2);
    }

    #[test]
    fn unbalanced_quote_only_costs_its_own_row() {
        let contents = format!(
            "{HEADER}T1,08:00:00,08:00:00,S1,1\n\
             \"T2,08:01:00,08:01:00,S2,x\n\
             T3,08:02:00,08:02:00,S3,3\n\
             T4,08:03:00,08:03:00,S4,4\n"
        );
        let (_dir, config) = fixture(&contents);

        let summary = run(&config).unwrap();

        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.accepted_rows, 3);
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].line, 3);
        let trips: Vec<_> = decode(&config.output)
            .stop_times
            .iter()
            .map(|row| row.trip_id.to_string())
            .collect();
        assert_eq!(trips, ["T1", "T3", "T4"]);
    }

    #[test]
    fn long_trip_id_is_skipped() {
        let contents = format!(
            "{HEADER}{},08:00:00,08:00:00,S1,1\nT2,08:00:00,08:00:00,S2,2\n",
            "T".repeat(64)
        );
        let (_dir, config) = fixture(&contents);

        let summary = run(&config).unwrap();
        assert_eq!(summary.accepted_rows, 1);
        assert_eq!(decode(&config.output).stop_times[0].trip_id.as_str(), "T2");
    }

    #[test]
    fn output_is_deterministic() {
        let (dir, mut config) = fixture(&rows(40));
        run(&config).unwrap();
        let first = fs::read(&config.output).unwrap();

        config.output = dir.path().join("again.msgpack");
        run(&config).unwrap();
        assert_eq!(first, fs::read(&config.output).unwrap());
    }

    #[test]
    fn missing_column_leaves_no_output() {
        let (_dir, config) = fixture("trip_id,arrival_time,departure_time,stop_id\nT1,08:00:00,08:00:00,S1\n");

        let err = run(&config).unwrap_err();

        match err {
            PrecacheError::HeaderFormat { missing } => assert_eq!(missing, vec![Field::StopSequence]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!config.output.exists());
    }

    #[test]
    fn fatal_error_keeps_previous_output() {
        let (_dir, config) = fixture("stop_id\n");
        fs::write(&config.output, b"previous").unwrap();

        assert!(run(&config).is_err());
        assert_eq!(fs::read(&config.output).unwrap(), b"previous");
    }

    #[test]
    fn empty_input_is_a_header_error() {
        let (_dir, config) = fixture("");
        assert!(matches!(
            run(&config),
            Err(PrecacheError::HeaderFormat { missing }) if missing.len() == 5
        ));
        assert!(!config.output.exists());
    }

    #[test]
    fn header_only_input_yields_empty_document() {
        let (_dir, config) = fixture(HEADER);
        let summary = run(&config).unwrap();
        assert_eq!(summary.total_rows, 0);
        assert!(decode(&config.output).stop_times.is_empty());
    }

    #[test]
    fn missing_input_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("nope.txt"), dir.path().join("out.msgpack"));
        config.show_progress = false;

        assert!(matches!(run(&config), Err(PrecacheError::FileAccess { .. })));
        assert!(!config.output.exists());
    }

    #[test]
    fn unwritable_output_dir_is_a_file_error() {
        let (dir, mut config) = fixture(&rows(2));
        config.output = dir.path().join("missing").join("out.msgpack");

        assert!(matches!(run(&config), Err(PrecacheError::FileAccess { .. })));
    }

    #[test]
    fn crlf_and_blank_lines() {
        let contents = "trip_id,stop_id,arrival_time,departure_time,stop_sequence\r\n\
                        T1,S1,08:00:00,08:00:00,1\r\n\
                        \r\n\
                        T1,S2,08:01:00,08:01:00,2\r\n";
        let (_dir, config) = fixture(contents);

        let summary = run(&config).unwrap();
        assert_eq!(summary.total_rows, 2);
        assert_eq!(decode(&config.output).stop_times[1].departure_time.as_str(), "08:01:00");
    }

    #[test]
    fn verify_reads_back_the_document() {
        let (_dir, mut config) = fixture(&rows(5));
        config.verify = true;
        run(&config).unwrap();

        assert!(matches!(
            verify(&config.output, 6),
            Err(PrecacheError::Encode(EncodeError::LengthMismatch {
                declared: 6,
                written: 5
            }))
        ));
    }

    #[test]
    fn input_changed_between_passes() {
        let (_dir, config) = fixture(&rows(3));
        let scan = ScanSummary {
            total_rows: 2,
            accepted_rows: 2,
        };
        let mut limiter = CpuLimiter::new(
            SystemClock::default(),
            ProportionalThrottle::new(1.0),
            config.check_interval,
        );
        let mut monitor = ProgressMonitor::new(2, config.sample_interval, false);

        let err = encode(&config.input, &config.output, scan, &mut limiter, &mut monitor)
            .unwrap_err();
        assert!(matches!(
            err,
            PrecacheError::InputChanged {
                declared: 2,
                written: 3
            }
        ));
        assert!(!config.output.exists());
        let leftovers: Vec<PathBuf> = fs::read_dir(config.output.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(leftovers, vec![config.input.clone()]);
    }
}
