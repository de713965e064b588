//! Trial records and the CSV log they are appended to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CSV_HEADER: &str =
    "direction,speed,range,noise_ms,start_position,end_position,recording,peak_level";

#[derive(Error, Debug)]
pub enum TrialLogError {
    #[error("Failed to open trial log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to append to trial log: {0}")]
    Write(#[from] io::Error),
}

/// Direction of an actuator move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "reverse" => Ok(Direction::Reverse),
            other => Err(format!("Invalid direction: {}", other)),
        }
    }
}

/// One bracketed actuator move and what was measured around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub direction: Direction,
    pub speed: u32,
    pub range: u32,
    #[serde(with = "millis")]
    pub noise: Duration,
    pub start_position: u32,
    pub end_position: u32,
    pub recording: Option<PathBuf>,
    /// Loudest meter reading during the move, 0 when the meter had no data
    pub peak_level: f64,
}

impl TrialRecord {
    pub fn to_csv_line(&self) -> String {
        let recording = self
            .recording
            .as_deref()
            .map(|path| quote_field(&path.to_string_lossy()))
            .unwrap_or_default();

        format!(
            "{},{},{},{},{},{},{},{}",
            self.direction,
            self.speed,
            self.range,
            self.noise.as_millis(),
            self.start_position,
            self.end_position,
            recording,
            self.peak_level
        )
    }
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Append-only CSV log of trial records
#[derive(Debug, Clone)]
pub struct TrialLog {
    path: PathBuf,
}

impl TrialLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, writing the header first when the log is new
    pub fn append(&self, record: &TrialRecord) -> Result<(), TrialLogError> {
        let file = self.open()?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{}", CSV_HEADER)?;
        }
        writeln!(writer, "{}", record.to_csv_line())?;
        writer.flush()?;
        Ok(())
    }

    fn open(&self) -> Result<File, TrialLogError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TrialLogError::Open {
                path: self.path.clone(),
                source,
            })
    }
}
