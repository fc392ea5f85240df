//! CSV append log and JSON export of measurements.

use crate::errors::{MonitorError, Result};
use crate::measurements::Measurement;
use chrono::{DateTime, Local};
use log::debug;
use serde::{Serialize, Serializer};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CSV_HEADER: &str = "timestamp;interface;download_mbps;upload_mbps;ping_avg_ms;jitter_ms;packet_loss_percent;http_resp_ms";

const CSV_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const JSON_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One CSV line for `m`, without the trailing newline.
pub fn csv_line(m: &Measurement) -> String {
    format!(
        "{};\"{}\";{:.2};{:.2};{:.2};{:.2};{:.2};{:.2}",
        m.timestamp.format(CSV_TIMESTAMP_FORMAT),
        m.interface.replace('"', "'"),
        m.download_mbps,
        m.upload_mbps,
        m.ping_avg_ms,
        m.jitter_ms,
        m.packet_loss_percent,
        m.http_response_ms
    )
}

/// Append-only, semicolon-delimited measurement log.
#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvLog {
    /// Open the log at `path`, writing the header if the file is new.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            let mut file = File::create(&path).map_err(|e| {
                MonitorError::io(format!("cannot create {}", path.display()), e)
            })?;
            writeln!(file, "{}", CSV_HEADER).map_err(|e| {
                MonitorError::io(format!("cannot write {}", path.display()), e)
            })?;
            debug!("Created CSV log {}", path.display());
        }

        Ok(Self { path, write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, measurement: &Measurement) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                MonitorError::io(format!("cannot open {}", self.path.display()), e)
            })?;

        writeln!(file, "{}", csv_line(measurement)).map_err(|e| {
            MonitorError::io(format!("cannot append to {}", self.path.display()), e)
        })
    }
}

/// One element of the JSON export.
#[derive(Debug, Serialize)]
struct ExportRecord<'a> {
    #[serde(serialize_with = "local_timestamp")]
    timestamp: DateTime<Local>,
    interface: &'a str,
    #[serde(serialize_with = "four_decimals")]
    download_mbps: f64,
    #[serde(serialize_with = "four_decimals")]
    upload_mbps: f64,
    #[serde(serialize_with = "four_decimals")]
    ping_avg_ms: f64,
    #[serde(serialize_with = "four_decimals")]
    jitter_ms: f64,
    #[serde(serialize_with = "four_decimals")]
    packet_loss_percent: f64,
    #[serde(serialize_with = "four_decimals")]
    http_response_ms: f64,
}

impl<'a> From<&'a Measurement> for ExportRecord<'a> {
    fn from(m: &'a Measurement) -> Self {
        Self {
            timestamp: m.timestamp,
            interface: &m.interface,
            download_mbps: m.download_mbps,
            upload_mbps: m.upload_mbps,
            ping_avg_ms: m.ping_avg_ms,
            jitter_ms: m.jitter_ms,
            packet_loss_percent: m.packet_loss_percent,
            http_response_ms: m.http_response_ms,
        }
    }
}

fn local_timestamp<S: Serializer>(
    timestamp: &DateTime<Local>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&timestamp.format(JSON_TIMESTAMP_FORMAT))
}

// JSON has no NaN or infinity.
fn four_decimals<S: Serializer>(
    value: &f64,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let rounded = if value.is_finite() {
        (value * 10_000.0).round() / 10_000.0
    } else {
        0.0
    };
    serializer.serialize_f64(rounded)
}

/// Write `measurements` to `path` as a JSON array, replacing any previous
/// export. The file is written under a temporary name and renamed into
/// place, so readers never observe a partial export.
pub fn export_json(path: &Path, measurements: &[Measurement]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let records: Vec<ExportRecord<'_>> = measurements.iter().map(ExportRecord::from).collect();

    let write = || -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut out, &records)?;
        writeln!(out)?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        MonitorError::io(format!("cannot write {}", tmp.display()), e)
    })?;

    debug!("Exported {} measurements to {}", records.len(), path.display());
    fs::rename(&tmp, path).map_err(|e| {
        MonitorError::io(format!("cannot replace {}", path.display()), e)
    })
}
