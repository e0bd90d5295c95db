//! Append-only pressure CSV.

use bubble_core::tags::PRESSURE_TAGS;
use bubble_core::{Reading, VALVE_COUNT};
use chrono::{DateTime, Local};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PressureLogError {
    #[error("pressure log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pressure log CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Column layout of a pressure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsvLayout {
    /// Wall-clock time and calibrated pressures, written while a sequence runs.
    #[default]
    Pressure,
    /// Unix seconds, raw pressures and every valve bit.
    Full,
}

impl CsvLayout {
    pub fn header(self) -> Vec<String> {
        let mut header = vec!["Time".to_string()];
        match self {
            CsvLayout::Pressure => {
                header.extend(PRESSURE_TAGS.iter().filter_map(|t| t.column).map(String::from));
            }
            CsvLayout::Full => {
                header.extend(
                    PRESSURE_TAGS[..3]
                        .iter()
                        .filter_map(|t| t.column)
                        .map(String::from),
                );
                header.extend((1..=VALVE_COUNT).map(|i| format!("ValveState{i}")));
            }
        }
        header
    }

    pub fn row(self, reading: &Reading) -> Vec<String> {
        match self {
            CsvLayout::Pressure => {
                let mut row = vec![clock_time(reading.unix_us)];
                row.extend(reading.calibrated().iter().map(|p| format!("{p:.4}")));
                row.push(
                    reading
                        .calibrated_external()
                        .map(|p| format!("{p:.4}"))
                        .unwrap_or_default(),
                );
                row
            }
            CsvLayout::Full => {
                let mut row = vec![format!("{:.3}", reading.unix_us as f64 / 1e6)];
                row.extend(reading.pressures.iter().map(|p| p.to_string()));
                row.extend(reading.valves.codes().iter().map(|c| c.to_string()));
                row
            }
        }
    }
}

fn clock_time(unix_us: u64) -> String {
    let secs = (unix_us / 1_000_000) as i64;
    let nanos = ((unix_us % 1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .map(|utc| utc.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

pub struct PressureLogger {
    path: PathBuf,
    layout: CsvLayout,
    writer: csv::Writer<File>,
    rows: u64,
}

impl PressureLogger {
    /// Creates the file (and its parent directories) and writes the header.
    pub fn create(path: impl AsRef<Path>, layout: CsvLayout) -> Result<Self, PressureLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(layout.header())?;
        writer.flush()?;
        info!(path = %path.display(), ?layout, "Pressure log started");
        Ok(Self {
            path,
            layout,
            writer,
            rows: 0,
        })
    }

    /// Writes and flushes one row.
    pub fn append(&mut self, reading: &Reading) -> Result<(), PressureLogError> {
        self.writer.write_record(self.layout.row(reading))?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> Result<PathBuf, PressureLogError> {
        self.writer.flush()?;
        info!(path = %self.path.display(), rows = self.rows, "Pressure log closed");
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bubble_core::{ValveState, ValveStateVector};
    use tempfile::tempdir;

    fn reading(raw: f64) -> Reading {
        Reading {
            unix_us: 1_700_000_000_250_000,
            pressures: [raw, raw, raw],
            external_pressure: None,
            valves: ValveStateVector::unchanged().with(1, ValveState::Open),
        }
    }

    #[test]
    fn pressure_layout_writes_calibrated_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run.csv");
        let mut log = PressureLogger::create(&path, CsvLayout::Pressure).unwrap();
        log.append(&reading(203.53)).unwrap();
        log.append(&reading(286.01)).unwrap();
        assert_eq!(log.rows(), 2);
        log.finish().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "Time,Pressure1,Pressure2,Pressure3,Pressure4");
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[1], "0.0000");
        assert_eq!(fields[4], "");
        assert_eq!(fields[0].len(), 8);
        assert!(lines[2].contains("1.0000"));
    }

    #[test]
    fn full_layout_has_valve_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.csv");
        let mut log = PressureLogger::create(&path, CsvLayout::Full).unwrap();
        log.append(&reading(300.0)).unwrap();
        drop(log);

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("Time,Pressure1,Pressure2,Pressure3,ValveState1"));
        assert_eq!(header.split(',').count(), 12);
        let row = lines.next().unwrap();
        assert_eq!(row, "1700000000.250,300,300,300,2,1,2,2,2,2,2,2");
    }
}
