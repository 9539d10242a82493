/*!
 * Test record sinks.
 *
 * While a test session is open the bench hands one flat [`Reading`] per
 * publish tick to a [`RecordSink`]. The sink owns file format and rotation;
 * [`CsvRecordSink`] writes one CSV file per session.
 */
use std::fmt::Debug;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::types::{to_unix_seconds, Reading};

/// Column order of a test record
pub const COLUMNS: [&str; 20] = [
    "flow_instantaneous",
    "flow_cumulative",
    "pressure_positive",
    "pressure_vacuum",
    "dc_voltage",
    "dc_current",
    "dc_power",
    "ac110_voltage",
    "ac110_current",
    "ac110_power",
    "ac220_voltage",
    "ac220_current",
    "ac220_power",
    "ac220_3p_voltage_a",
    "ac220_3p_voltage_b",
    "ac220_3p_voltage_c",
    "ac220_3p_current_a",
    "ac220_3p_current_b",
    "ac220_3p_current_c",
    "ac220_3p_total_power",
];

/// Destination of test readings
pub trait RecordSink: Send + Sync + Debug {
    /// Open a session keyed by test id. Opening while a session is active keeps the active one.
    fn start_session(&self, test_id: &str) -> Result<()>;

    /// Close the active session, if any
    fn stop_session(&self) -> Result<()>;

    /// Append a reading to the active session; without a session this is a no-op
    fn record(&self, reading: &Reading) -> Result<()>;

    /// Test id of the active session
    fn active_session(&self) -> Option<String>;
}

/// A sink that drops everything
#[derive(Debug, Default)]
pub struct NullRecordSink;

impl RecordSink for NullRecordSink {
    fn start_session(&self, _test_id: &str) -> Result<()> {
        Ok(())
    }

    fn stop_session(&self) -> Result<()> {
        Ok(())
    }

    fn record(&self, _reading: &Reading) -> Result<()> {
        Ok(())
    }

    fn active_session(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    active: Option<String>,
    sessions: Vec<(String, Vec<Reading>)>,
}

/// A sink that keeps every session in memory
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    state: Mutex<MemoryState>,
}

impl MemoryRecordSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Test ids of every session opened so far, in order
    pub fn session_ids(&self) -> Vec<String> {
        self.state.lock().sessions.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Readings recorded for one session
    pub fn readings(&self, test_id: &str) -> Vec<Reading> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|(id, _)| id == test_id)
            .flat_map(|(_, readings)| readings.iter().cloned())
            .collect()
    }
}

impl RecordSink for MemoryRecordSink {
    fn start_session(&self, test_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(active) = &state.active {
            warn!(active = %active, "Record session already open");
            return Ok(());
        }
        state.active = Some(test_id.to_string());
        state.sessions.push((test_id.to_string(), Vec::new()));
        Ok(())
    }

    fn stop_session(&self) -> Result<()> {
        self.state.lock().active = None;
        Ok(())
    }

    fn record(&self, reading: &Reading) -> Result<()> {
        let mut state = self.state.lock();
        if state.active.is_none() {
            return Ok(());
        }
        if let Some((_, readings)) = state.sessions.last_mut() {
            readings.push(reading.clone());
        }
        Ok(())
    }

    fn active_session(&self) -> Option<String> {
        self.state.lock().active.clone()
    }
}

#[derive(Debug)]
struct CsvSession {
    test_id: String,
    path: PathBuf,
    writer: csv::Writer<File>,
}

/// A sink writing `test_<id>_<YYYYmmdd_HHMMSS>.csv` files below a directory
#[derive(Debug)]
pub struct CsvRecordSink {
    dir: PathBuf,
    session: Mutex<Option<CsvSession>>,
}

impl CsvRecordSink {
    /// Create a sink writing below `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            session: Mutex::new(None),
        })
    }

    /// Path of the file of the active session
    pub fn active_path(&self) -> Option<PathBuf> {
        self.session.lock().as_ref().map(|session| session.path.clone())
    }

    fn header() -> Vec<&'static str> {
        let mut header = Vec::with_capacity(COLUMNS.len() + 1);
        header.push("timestamp");
        header.extend_from_slice(&COLUMNS);
        header
    }
}

impl RecordSink for CsvRecordSink {
    fn start_session(&self, test_id: &str) -> Result<()> {
        let mut session = self.session.lock();
        if let Some(active) = session.as_ref() {
            warn!(active = %active.test_id, "Record session already open");
            return Ok(());
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("test_{}_{}.csv", test_id, stamp));
        let mut writer = csv::Writer::from_path(&path).map_err(|e| {
            error!(path = %path.display(), "Failed to create test record: {}", e);
            Error::from(e)
        })?;
        writer.write_record(Self::header())?;
        writer.flush()?;

        info!(path = %path.display(), "Test record started");
        *session = Some(CsvSession {
            test_id: test_id.to_string(),
            path,
            writer,
        });
        Ok(())
    }

    fn stop_session(&self) -> Result<()> {
        if let Some(mut session) = self.session.lock().take() {
            session.writer.flush()?;
            info!(test_id = %session.test_id, "Test record stopped");
        }
        Ok(())
    }

    fn record(&self, reading: &Reading) -> Result<()> {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };

        let mut row = Vec::with_capacity(COLUMNS.len() + 1);
        row.push(to_unix_seconds(reading.timestamp).to_string());
        for column in COLUMNS {
            row.push(reading.get(column).map(|v| v.to_string()).unwrap_or_default());
        }
        session.writer.write_record(&row)?;
        session.writer.flush()?;
        Ok(())
    }

    fn active_session(&self) -> Option<String> {
        self.session.lock().as_ref().map(|session| session.test_id.clone())
    }
}
