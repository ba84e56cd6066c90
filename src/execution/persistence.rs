use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::error::JournalError;
use crate::execution::types::{CycleRecord, OrderOutcome};

/// Append-only sink for cycle records.
pub trait CycleJournal: Send + Sync {
    fn append(&self, record: &CycleRecord) -> Result<(), JournalError>;
}

fn ts_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// SQLite-backed journal. One row per (market, cycle); the full record is
/// kept as JSON next to a few query columns.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    pub fn new(db_path: &str) -> Result<Self, JournalError> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_records (
                market_id TEXT NOT NULL,
                cycle_ts TEXT NOT NULL,
                outcome TEXT NOT NULL,
                idempotency_key TEXT,
                fill_quantity INTEGER,
                fill_price REAL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (market_id, cycle_ts)
            );

            CREATE INDEX IF NOT EXISTS idx_cycle_records_outcome ON cycle_records(outcome);
            CREATE INDEX IF NOT EXISTS idx_cycle_records_cycle_ts ON cycle_records(cycle_ts);
            "#,
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self, JournalError> {
        Self::new(":memory:")
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records in cycle order, optionally for one market.
    pub fn records(&self, market_id: Option<&str>) -> Result<Vec<CycleRecord>, JournalError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload FROM cycle_records
             WHERE ?1 IS NULL OR market_id = ?1
             ORDER BY cycle_ts, market_id",
        )?;

        let payloads = stmt
            .query_map(params![market_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(JournalError::from))
            .collect()
    }

    pub fn count_by_outcome(&self, label: &str) -> Result<usize, JournalError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM cycle_records WHERE outcome = ?1",
            params![label],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Failed submissions whose exchange-side state was never confirmed.
    pub fn unreconciled(&self) -> Result<Vec<CycleRecord>, JournalError> {
        let records = self.records(None)?;
        Ok(unresolved_orders(&records).into_iter().cloned().collect())
    }
}

impl CycleJournal for SqliteJournal {
    fn append(&self, record: &CycleRecord) -> Result<(), JournalError> {
        let payload = serde_json::to_string(record)?;
        let fill = record.outcome.fill();
        let cycle_ts = ts_key(record.cycle_ts);

        let result = self.conn().execute(
            "INSERT INTO cycle_records
             (market_id, cycle_ts, outcome, idempotency_key,
              fill_quantity, fill_price, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.market_id,
                cycle_ts,
                record.outcome.label(),
                record.intent.as_ref().map(|i| i.idempotency_key.as_str()),
                fill.map(|(q, _)| q as i64),
                fill.map(|(_, p)| p),
                payload,
                ts_key(Utc::now()),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(JournalError::Duplicate {
                    market_id: record.market_id.clone(),
                    cycle_ts,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process journal, used by backtests and tests.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<CycleRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CycleJournal for MemoryJournal {
    fn append(&self, record: &CycleRecord) -> Result<(), JournalError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records
            .iter()
            .any(|r| r.market_id == record.market_id && r.cycle_ts == record.cycle_ts)
        {
            return Err(JournalError::Duplicate {
                market_id: record.market_id.clone(),
                cycle_ts: ts_key(record.cycle_ts),
            });
        }
        records.push(record.clone());
        Ok(())
    }
}

/// Writes every record to each journal. The first error is returned after
/// all journals have been tried.
pub struct TeeJournal {
    journals: Vec<Arc<dyn CycleJournal>>,
}

impl TeeJournal {
    pub fn new(journals: Vec<Arc<dyn CycleJournal>>) -> Self {
        Self { journals }
    }
}

impl CycleJournal for TeeJournal {
    fn append(&self, record: &CycleRecord) -> Result<(), JournalError> {
        let mut first_error = None;
        for journal in &self.journals {
            if let Err(e) = journal.append(record) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Failed submissions with no later record for the same idempotency key.
///
/// Records must be in cycle order. A later record carrying the key with any
/// outcome other than Failed means the order was reconciled.
pub fn unresolved_orders(records: &[CycleRecord]) -> Vec<&CycleRecord> {
    let mut open: Vec<&CycleRecord> = Vec::new();
    for record in records {
        let Some(intent) = &record.intent else {
            continue;
        };
        open.retain(|r| {
            r.intent
                .as_ref()
                .map_or(true, |i| i.idempotency_key != intent.idempotency_key)
        });
        if matches!(record.outcome, OrderOutcome::Failed { .. }) {
            open.push(record);
        }
    }
    open
}

/// Load the journal on startup and report what needs attention.
pub fn recover_from_journal(journal: &SqliteJournal) -> Result<Vec<CycleRecord>, JournalError> {
    info!("Performing crash recovery...");

    let records = journal.records(None)?;
    info!(
        "Found {} cycle records ({} filled, {} partially filled)",
        records.len(),
        journal.count_by_outcome("filled")?,
        journal.count_by_outcome("partially_filled")?
    );

    let unreconciled = journal.unreconciled()?;
    if unreconciled.is_empty() {
        info!("No unreconciled submissions");
    }
    for record in &unreconciled {
        if let Some(intent) = &record.intent {
            warn!(
                "Unreconciled order {} ({} {} x{} @ {:.2}): {}",
                intent.idempotency_key,
                intent.market_id,
                intent.side,
                intent.quantity,
                intent.limit_price,
                record.outcome.reason().unwrap_or("unknown")
            );
        }
    }

    info!("Crash recovery complete");
    Ok(records)
}

/// Log-and-continue append used on the hot path.
pub fn append_or_log(journal: &dyn CycleJournal, record: &CycleRecord) {
    if let Err(e) = journal.append(record) {
        error!(
            "Failed to journal cycle record for {} at {}: {}",
            record.market_id, record.cycle_ts, e
        );
    }
}
