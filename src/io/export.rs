//! CSV export for tick records.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::TwinError;
use crate::sim::types::{TickRecord, format_time};
use crate::telemetry::Publisher;

/// Column header for CSV telemetry export.
pub const HEADER: &str = "tick,time,state_at,zone,interior_c,envelope_c,measured_c,\
                          exterior_c,solar_w_m2,solar_gain_w,tariff,price_per_kwh,\
                          command_pct,heater_w,energy_kwh,cost,cumulative_cost,source,events";

/// How an export treats an existing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep existing rows and add new ones after them.
    #[default]
    Append,
    /// Truncate the file before writing.
    Reset,
}

fn row(r: &TickRecord) -> Vec<String> {
    vec![
        r.tick.to_string(),
        format_time(r.time),
        format_time(r.state_at),
        r.zone.clone(),
        format!("{:.4}", r.interior_c),
        r.envelope_c.map(|t| format!("{t:.4}")).unwrap_or_default(),
        format!("{:.4}", r.measured_c),
        format!("{:.4}", r.exterior_c),
        format!("{:.2}", r.solar_w_m2),
        format!("{:.2}", r.solar_gain_w),
        r.tariff.to_string(),
        format!("{:.4}", r.price_per_kwh),
        format!("{:.2}", r.command_pct),
        format!("{:.2}", r.heater_w),
        format!("{:.6}", r.energy_kwh),
        format!("{:.6}", r.cost),
        format!("{:.6}", r.cumulative_cost),
        r.source.to_string(),
        r.events
            .iter()
            .map(|e| e.kind())
            .collect::<Vec<_>>()
            .join(";"),
    ]
}

/// Opens `path` for writing under `mode`; also reports whether the file is empty.
pub(crate) fn open_for_write(path: &Path, mode: WriteMode) -> io::Result<(File, bool)> {
    let file = match mode {
        WriteMode::Append => OpenOptions::new().create(true).append(true).open(path)?,
        WriteMode::Reset => File::create(path)?,
    };
    let empty = file.metadata()?.len() == 0;
    Ok((file, empty))
}

/// Writes tick records as CSV to any writer.
///
/// # Arguments
///
/// * `records` - Tick records in order
/// * `writer` - Destination implementing `Write`
/// * `with_header` - Whether to write the header row first
///
/// # Errors
///
/// Returns a `csv::Error` if writing fails.
pub fn write_csv(
    records: &[TickRecord],
    writer: impl Write,
    with_header: bool,
) -> Result<(), csv::Error> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    if with_header {
        wtr.write_record(HEADER.split(',').map(str::trim))?;
    }
    for r in records {
        wtr.write_record(row(r))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Exports tick records to a CSV file at the given path.
///
/// The header is written only when the file ends up starting empty, so
/// repeated appends produce a single header.
///
/// # Errors
///
/// Returns [`TwinError::Io`] or [`TwinError::Csv`] if opening or writing fails.
pub fn export_csv(records: &[TickRecord], path: &Path, mode: WriteMode) -> Result<(), TwinError> {
    let (file, empty) = open_for_write(path, mode)?;
    write_csv(records, io::BufWriter::new(file), empty)?;
    Ok(())
}

/// Publisher that streams each tick to a CSV file as it happens.
#[derive(Debug)]
pub struct CsvPublisher {
    wtr: csv::Writer<io::BufWriter<File>>,
}

impl CsvPublisher {
    /// Opens `path` for streaming.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Io`] or [`TwinError::Csv`] if the file cannot be
    /// opened or the header cannot be written.
    pub fn open(path: &Path, mode: WriteMode) -> Result<Self, TwinError> {
        let (file, empty) = open_for_write(path, mode)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(io::BufWriter::new(file));
        if empty {
            wtr.write_record(HEADER.split(',').map(str::trim))?;
        }
        Ok(Self { wtr })
    }
}

impl Publisher for CsvPublisher {
    fn publish(&mut self, record: &TickRecord) -> Result<(), TwinError> {
        self.wtr.write_record(row(record))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TwinError> {
        self.wtr.flush()?;
        Ok(())
    }
}
