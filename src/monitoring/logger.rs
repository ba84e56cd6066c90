use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::JournalError;
use crate::execution::persistence::CycleJournal;
use crate::execution::types::CycleRecord;

const HEADER: &str = "cycle_ts,market_id,bid,ask,forecast,edge,recommendation,side,quantity,limit_price,idempotency_key,outcome,fill_quantity,fill_price,reason";

/// Audit trail: one CSV row per cycle record.
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: &str) -> Result<Self, JournalError> {
        // Create CSV file with headers if it doesn't exist
        if !Path::new(log_path).exists() {
            let mut file = OpenOptions::new().create(true).write(true).open(log_path)?;
            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self {
            log_path: log_path.to_string(),
        })
    }
}

impl CycleJournal for CsvLogger {
    fn append(&self, record: &CycleRecord) -> Result<(), JournalError> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        writeln!(file, "{}", csv_row(record))?;
        Ok(())
    }
}

fn csv_row(record: &CycleRecord) -> String {
    let opt = |v: Option<String>| v.unwrap_or_default();
    let fill = record.outcome.fill();

    [
        record.cycle_ts.to_rfc3339(),
        csv_field(&record.market_id),
        opt(record.market.as_ref().map(|m| format!("{:.2}", m.bid))),
        opt(record.market.as_ref().map(|m| format!("{:.2}", m.ask))),
        opt(record.forecast.as_ref().map(|f| format!("{:.4}", f.probability))),
        opt(record.signal.as_ref().map(|s| format!("{:.4}", s.edge))),
        opt(record.signal.as_ref().map(|s| format!("{:?}", s.recommendation))),
        opt(record.intent.as_ref().map(|i| i.side.to_string())),
        opt(record.intent.as_ref().map(|i| i.quantity.to_string())),
        opt(record.intent.as_ref().map(|i| format!("{:.2}", i.limit_price))),
        opt(record.intent.as_ref().map(|i| csv_field(&i.idempotency_key))),
        record.outcome.label().to_string(),
        opt(fill.map(|(q, _)| q.to_string())),
        opt(fill.map(|(_, p)| format!("{:.2}", p))),
        csv_field(record.outcome.reason().unwrap_or("")),
    ]
    .join(",")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::{OrderIntent, OrderOutcome};
    use crate::strategies::types::Side;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_row_for_fill() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut record =
            CycleRecord::new("M", ts, OrderOutcome::Filled { quantity: 10, price: 0.65 });
        record.intent = Some(OrderIntent::new("M", Side::Yes, 10, 0.65, ts));

        let row = csv_row(&record);
        assert_eq!(row.split(',').count(), HEADER.split(',').count());
        assert!(row.contains(",yes,10,0.65,M-1735732800000-yes,filled,10,0.65,"));
    }

    #[test]
    fn test_reason_with_comma_is_quoted() {
        assert_eq!(csv_field("spread 0.35, too wide"), "\"spread 0.35, too wide\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn test_appends_under_header() {
        let path = std::env::temp_dir().join(format!("celsius-csv-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let path_str = path.to_string_lossy().to_string();

        let logger = CsvLogger::new(&path_str).unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        logger
            .append(&CycleRecord::new("M", ts, OrderOutcome::skipped("quote unavailable")))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].ends_with(",skipped,,,quote unavailable"));
        let _ = std::fs::remove_file(&path);
    }
}
