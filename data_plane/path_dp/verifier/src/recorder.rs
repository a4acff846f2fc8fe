//! # Report Recorder
//!
//! Optional SQLite persistence of every ingested report, for offline
//! inspection of which transitions a flow took. Inserts are grouped into
//! transactions of `batch_size` reports.
//!
//! Transaction state is read from the connection rather than tracked on the
//! side: a lock timeout or failed `COMMIT` can leave a batch open, and the
//! next call has to pick up from whatever SQLite actually holds.

use log::{debug, info, warn};
use policy_engine::ProbeId;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, VerifierError};
use crate::telemetry::{FlowKey, Report};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reports (
    u INTEGER,
    v INTEGER,
    src_ip TEXT,
    dst_ip TEXT,
    src_port INTEGER,
    dst_port INTEGER,
    proto INTEGER,
    ts REAL
);
CREATE INDEX IF NOT EXISTS idx_sip ON reports (src_ip);
CREATE INDEX IF NOT EXISTS idx_dip ON reports (dst_ip);
CREATE INDEX IF NOT EXISTS idx_sport ON reports (src_port);
CREATE INDEX IF NOT EXISTS idx_dport ON reports (dst_port);
CREATE INDEX IF NOT EXISTS idx_proto ON reports (proto);
CREATE INDEX IF NOT EXISTS idx_5tup ON reports (src_ip, dst_ip, src_port, dst_port, proto);
CREATE INDEX IF NOT EXISTS idx_u ON reports (u);
CREATE INDEX IF NOT EXISTS idx_v ON reports (v);
CREATE INDEX IF NOT EXISTS idx_edge ON reports (u, v);
CREATE INDEX IF NOT EXISTS idx_ts ON reports (ts);
";

const INSERT: &str = "INSERT INTO reports (u, v, src_ip, dst_ip, src_port, dst_port, proto, ts)
                      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// Recorder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Reports per committed transaction
    pub batch_size: usize,
    /// Clear reports left by a previous run when opening
    pub truncate: bool,
    /// How long to wait on a database locked by another connection
    pub busy_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("path_reports.db"),
            batch_size: 10_000,
            truncate: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Batched SQLite writer for telemetry reports.
pub struct ReportRecorder {
    conn: Connection,
    batch_size: usize,
    pending: usize,
    recorded: u64,
}

impl ReportRecorder {
    /// Opens (or creates) the database at `config.path`.
    pub fn open(config: &RecorderConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&config.path)?;
        let recorder = Self::with_connection(conn, config)?;
        info!(
            "Recording reports to {} (batch size {})",
            config.path.display(),
            recorder.batch_size
        );
        Ok(recorder)
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory(batch_size: usize) -> Result<Self> {
        let config = RecorderConfig {
            batch_size,
            ..RecorderConfig::default()
        };
        Self::with_connection(Connection::open_in_memory()?, &config)
    }

    fn with_connection(conn: Connection, config: &RecorderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(VerifierError::config(
                "batch_size",
                "must be at least 1",
            ));
        }
        conn.busy_timeout(config.busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        if config.truncate {
            conn.execute("DELETE FROM reports", [])?;
        }
        Ok(Self {
            conn,
            batch_size: config.batch_size,
            pending: 0,
            recorded: 0,
        })
    }

    /// Appends one report, committing when the batch is full.
    ///
    /// On error the report may or may not be part of the open batch; a
    /// later call retries the transaction from its current state.
    pub fn record(&mut self, report: &Report) -> Result<()> {
        if self.conn.is_autocommit() {
            if self.pending > 0 {
                warn!("SQLite rolled back a batch of {} reports", self.pending);
                self.pending = 0;
            }
            // IMMEDIATE takes the write lock up front, so lock contention
            // fails here and leaves no transaction behind.
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }

        let inserted = self.conn.prepare_cached(INSERT).and_then(|mut stmt| {
            stmt.execute(params![
                report.prev_probe,
                report.probe,
                report.flow.src_addr.to_string(),
                report.flow.dst_addr.to_string(),
                report.flow.src_port,
                report.flow.dst_port,
                report.flow.protocol,
                report.timestamp,
            ])
        });
        if let Err(e) = inserted {
            if self.pending == 0 && !self.conn.is_autocommit() {
                self.rollback();
            }
            return Err(e.into());
        }

        self.pending += 1;
        self.recorded += 1;
        if self.pending >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    /// Commits any open batch.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending > 0 || !self.conn.is_autocommit() {
            self.commit()?;
        }
        Ok(())
    }

    /// A `COMMIT` refused with `SQLITE_BUSY` keeps the batch open and is
    /// retried by the next commit; one that ends the transaction loses it.
    fn commit(&mut self) -> Result<()> {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                if self.conn.is_autocommit() {
                    warn!("Batch of {} reports lost on failed commit", self.pending);
                    self.pending = 0;
                }
                return Err(e.into());
            }
        }
        debug!("Committed {} reports", self.pending);
        self.pending = 0;
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            warn!("Failed to roll back empty batch: {}", e);
        }
    }

    /// Reports inserted so far, committed or pending.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Reports in the currently open batch.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Recorded reports of the transition `u -> v`, in insertion order.
    pub fn reports_for_hop(&self, u: ProbeId, v: ProbeId) -> Result<Vec<Report>> {
        let mut stmt = self.conn.prepare(
            "SELECT src_ip, dst_ip, src_port, dst_port, proto, ts
             FROM reports WHERE u = ?1 AND v = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![u, v], |row| {
            let flow = FlowKey {
                src_addr: addr_column(row, 0)?,
                dst_addr: addr_column(row, 1)?,
                src_port: row.get(2)?,
                dst_port: row.get(3)?,
                protocol: row.get(4)?,
            };
            Ok(Report::new(flow, u, v, row.get(5)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn addr_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ipv4Addr> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
