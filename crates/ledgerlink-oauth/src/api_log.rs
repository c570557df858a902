//! Per-connection API call log.
//!
//! Each forwarded API call becomes one [`ApiCallRecord`] line in a
//! daily-rotating `api-YYYY-MM-DD.jsonl` file under the connection's
//! `logs_path`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One API request/response exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub id: String,
    /// ISO-8601 timestamp when the request was sent.
    pub timestamp: String,
    pub connection: String,
    pub realm_id: Option<String>,
    pub method: String,
    pub path: String,
    /// HTTP status, absent when no response arrived.
    pub status: Option<u16>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiCallRecord {
    pub fn new(
        connection: impl Into<String>,
        realm_id: Option<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            connection: connection.into(),
            realm_id,
            method: method.into(),
            path: path.into(),
            status: None,
            duration_ms: 0,
            error: None,
        }
    }
}

/// JSONL writer with daily file rotation.
pub struct ApiCallLogger {
    dir: PathBuf,
    state: Mutex<WriterState>,
}

struct WriterState {
    current_date: Option<NaiveDate>,
    writer: Option<BufWriter<File>>,
}

impl std::fmt::Debug for ApiCallLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCallLogger")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl ApiCallLogger {
    /// Create a logger writing into `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            state: Mutex::new(WriterState {
                current_date: None,
                writer: None,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file records for `date` go to.
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("api-{}.jsonl", date))
    }

    /// Append a record.
    pub fn log(&self, record: &ApiCallRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let today = Utc::now().date_naive();
        let mut state = self.state.lock();

        if state.current_date != Some(today) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.file_for(today))?;
            state.writer = Some(BufWriter::new(file));
            state.current_date = Some(today);
        }

        if let Some(ref mut w) = state.writer {
            writeln!(w, "{}", line)?;
            w.flush()?;
        }

        tracing::trace!(
            call_id = %record.id,
            connection = %record.connection,
            path = %record.path,
            "api call logged"
        );

        Ok(())
    }
}
