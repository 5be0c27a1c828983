//! History Logger: append-only, date-partitioned record of every
//! inference tick, batched and flushed off the hot path, per spec §4.8.
//!
//! Grounded on spec §4.8's shape (storage engine unspecified, only
//! shape — spec §1) and enriched with `csv` for the partitioned on-disk
//! format, the way `Zuytan-rustrade` persists tabular data; queueing
//! follows the teacher's bounded-channel decoupling pattern
//! (`crossbeam-channel`, used for the hardened ingest pipeline's
//! internal fan-out).

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::HistoryError;
use crate::feature_pipeline::FeatureVector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub feature_vector: FeatureVector,
    pub price: f64,
}

/// Bounded queue with the overflow policy spec §4.8/§5 specify: counted,
/// and the oldest sample for the same (ticker, second) is dropped before
/// newer ones — never a blanket oldest-overall drop, which would starve
/// whichever ticker happens to produce first.
pub struct HistoryLogger {
    tx: Sender<HistoricalRecord>,
    rx_for_flusher: Receiver<HistoricalRecord>,
    overflow_count: Arc<AtomicU64>,
    root: PathBuf,
    flush_interval: Duration,
    pending_by_key: Arc<parking_lot::Mutex<HashMap<(String, i64), HistoricalRecord>>>,
}

impl HistoryLogger {
    pub fn new(root: impl Into<PathBuf>, capacity: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx_for_flusher: rx,
            overflow_count: Arc::new(AtomicU64::new(0)),
            root: root.into(),
            flush_interval,
            pending_by_key: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Never blocks the caller. On a full queue, the record replaces
    /// whatever is pending for the same (ticker, second) rather than being
    /// silently lost across the board.
    pub fn record(&self, record: HistoricalRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                let key = (record.ticker.clone(), record.timestamp.timestamp());
                let mut pending = self.pending_by_key.lock();
                pending.insert(key, record);
                warn!("history_logger_queue_full_coalescing_by_ticker_second");
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("history_logger_channel_disconnected");
            }
        }
    }

    /// Drains the queue and any coalesced overflow records, writing one
    /// CSV partition file per calendar date under `root`.
    pub fn flush(&self) -> Result<usize, HistoryError> {
        let mut by_date: HashMap<NaiveDate, Vec<HistoricalRecord>> = HashMap::new();

        while let Ok(record) = self.rx_for_flusher.try_recv() {
            by_date.entry(record.timestamp.date_naive()).or_default().push(record);
        }
        {
            let mut pending = self.pending_by_key.lock();
            for (_, record) in pending.drain() {
                by_date.entry(record.timestamp.date_naive()).or_default().push(record);
            }
        }

        let mut written = 0;
        for (date, records) in by_date {
            written += records.len();
            self.write_partition(date, &records)?;
        }
        Ok(written)
    }

    fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    fn write_partition(&self, date: NaiveDate, records: &[HistoricalRecord]) -> Result<(), HistoryError> {
        let path = self.partition_path(date);
        fs::create_dir_all(&self.root).map_err(|e| HistoryError::Io {
            partition: path.display().to_string(),
            source: e,
        })?;

        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| HistoryError::Io { partition: path.display().to_string(), source: e })?;

        let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
        for record in records {
            let row = FlatRow::from(record);
            writer
                .serialize(&row)
                .map_err(|e| HistoryError::Io {
                    partition: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })?;
        }
        writer.flush().map_err(|e| HistoryError::Io { partition: path.display().to_string(), source: e })?;
        Ok(())
    }

    /// Called on shutdown: flush immediately rather than waiting for the
    /// next scheduled interval.
    pub fn flush_on_shutdown(&self) {
        match self.flush() {
            Ok(n) => info!(records = n, "history_logger_flushed_on_shutdown"),
            Err(e) => error!(error = %e, "history_logger_shutdown_flush_failed"),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn partition_dir(&self) -> &Path {
        &self.root
    }
}

#[derive(Debug, Serialize)]
struct FlatRow {
    timestamp: String,
    ticker: String,
    price: f64,
    schema_version: u32,
    ofi: f64,
    ofi_masked: bool,
    trade_intensity: f64,
    trade_intensity_masked: bool,
    volume_ratio: f64,
    volume_ratio_masked: bool,
    momentum_5m: f64,
    momentum_5m_masked: bool,
    rsi14: f64,
    rsi14_masked: bool,
    macd_histogram: f64,
    macd_histogram_masked: bool,
    bollinger_percent_b: f64,
    bollinger_percent_b_masked: bool,
    distance_to_ma20: f64,
    distance_to_ma20_masked: bool,
    volume_acceleration: f64,
    volume_acceleration_masked: bool,
}

impl From<&HistoricalRecord> for FlatRow {
    fn from(r: &HistoricalRecord) -> Self {
        let fv = &r.feature_vector;
        Self {
            timestamp: r.timestamp.to_rfc3339(),
            ticker: r.ticker.clone(),
            price: r.price,
            schema_version: fv.schema_version,
            ofi: fv.ofi.value,
            ofi_masked: fv.ofi.masked,
            trade_intensity: fv.trade_intensity.value,
            trade_intensity_masked: fv.trade_intensity.masked,
            volume_ratio: fv.volume_ratio.value,
            volume_ratio_masked: fv.volume_ratio.masked,
            momentum_5m: fv.momentum_5m.value,
            momentum_5m_masked: fv.momentum_5m.masked,
            rsi14: fv.rsi14.value,
            rsi14_masked: fv.rsi14.masked,
            macd_histogram: fv.macd_histogram.value,
            macd_histogram_masked: fv.macd_histogram.masked,
            bollinger_percent_b: fv.bollinger_percent_b.value,
            bollinger_percent_b_masked: fv.bollinger_percent_b.masked,
            distance_to_ma20: fv.distance_to_ma20.value,
            distance_to_ma20_masked: fv.distance_to_ma20.masked,
            volume_acceleration: fv.volume_acceleration.value,
            volume_acceleration_masked: fv.volume_acceleration.masked,
        }
    }
}

/// Nightly retention pruning: deletes partitions older than `retain_days`
/// relative to `now`, per spec §3's "rolling window of N days".
pub fn prune_retention(root: &Path, retain_days: u32, now: DateTime<Utc>) -> std::io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let cutoff = now.date_naive() - chrono::Duration::days(retain_days as i64);
    let mut pruned = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        if let Ok(date) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") {
            if date < cutoff {
                fs::remove_file(&path)?;
                pruned += 1;
            }
        }
    }
    Ok(pruned)
}
