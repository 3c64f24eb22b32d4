//! Reading History
//!
//! An accumulating consumer: every frame received from the relay becomes a
//! numbered [`Reading`]. The history can be bounded, queried for the latest
//! value or for chartable numbers, and exported as CSV or JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::relay::Frame;

/// One received reading
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// 1-based position in the stream
    pub index: u64,
    /// When this consumer received it
    pub received_at: DateTime<Utc>,
    /// The payload exactly as relayed
    pub value: String,
}

impl Reading {
    /// The value as a number, if it is one
    pub fn numeric(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }
}

/// Export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(HistoryError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Accumulated readings in arrival order
#[derive(Debug, Clone, Default)]
pub struct History {
    readings: VecDeque<Reading>,
    capacity: Option<usize>,
    next_index: u64,
}

impl History {
    /// Unbounded history
    pub fn new() -> Self {
        Self::default()
    }

    /// History that keeps only the most recent `capacity` readings
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    /// Record a relayed frame
    pub fn push(&mut self, frame: &Frame) -> &Reading {
        self.push_value(frame.to_text_lossy().into_owned(), Utc::now())
    }

    /// Record a value received at a given time
    pub fn push_value(
        &mut self,
        value: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> &Reading {
        if let Some(capacity) = self.capacity {
            while self.readings.len() >= capacity {
                self.readings.pop_front();
            }
        }

        self.next_index += 1;
        self.readings.push_back(Reading {
            index: self.next_index,
            received_at,
            value: value.into(),
        });

        // Just pushed, so the deque is non-empty
        &self.readings[self.readings.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Total readings seen, including any dropped by the capacity bound
    pub fn total_received(&self) -> u64 {
        self.next_index
    }

    /// The most recent reading (what a live display shows)
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    /// Numeric values in order, skipping readings that are not numbers
    pub fn numeric_values(&self) -> Vec<f64> {
        self.readings.iter().filter_map(Reading::numeric).collect()
    }

    /// Write the history in the given format
    pub fn export<W: Write>(&self, format: ExportFormat, writer: W) -> Result<(), HistoryError> {
        match format {
            ExportFormat::Csv => self.write_csv(writer),
            ExportFormat::Json => self.write_json(writer),
        }
    }

    /// Write `index,received_at,value` rows with a header
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), HistoryError> {
        let mut wtr = csv::Writer::from_writer(writer);
        if self.readings.is_empty() {
            wtr.write_record(["index", "received_at", "value"])?;
        }
        for reading in &self.readings {
            wtr.serialize(reading)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write a JSON array of readings
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), HistoryError> {
        serde_json::to_writer_pretty(writer, &self.readings)?;
        Ok(())
    }

    /// Export to a file, creating or truncating it
    pub fn save(&self, path: &Path, format: ExportFormat) -> Result<(), HistoryError> {
        let file = std::fs::File::create(path)?;
        self.export(format, std::io::BufWriter::new(file))?;
        tracing::info!(path = ?path, format = %format, readings = self.len(), "History exported");
        Ok(())
    }
}

/// History errors
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Unknown export format '{0}' (expected csv or json)")]
    UnknownFormat(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
