use std::fs::{self, File, OpenOptions};
use std::path::Path;

use crate::error::Result;
use crate::execution::types::{OrderIntent, OrderResult};

const HEADER: [&str; 13] = [
    "timestamp",
    "run_id",
    "idempotency_key",
    "market_id",
    "city",
    "bucket",
    "side",
    "price",
    "size_usd",
    "status",
    "fill_price",
    "fill_size",
    "error",
];

/// Append-only CSV trail of order outcomes, one row per result.
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        let path = Path::new(&log_path);
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let mut writer = writer(OpenOptions::new().create(true).write(true).open(path)?);
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        Ok(Self { log_path })
    }

    pub fn log_order(&self, intent: &OrderIntent, result: &OrderResult) -> Result<()> {
        let mut writer = writer(OpenOptions::new().append(true).open(&self.log_path)?);

        let executed_at = result.executed_at.to_rfc3339();
        let price = format!("{:.4}", intent.price);
        let size_usd = format!("{:.2}", intent.size_usd);
        let fill_price = result.fill_price.map(|p| format!("{:.4}", p)).unwrap_or_default();
        let fill_size = result.fill_size.map(|s| format!("{:.2}", s)).unwrap_or_default();

        let record: [&str; 13] = [
            &executed_at,
            &intent.run_id,
            &result.idempotency_key,
            &intent.market_id,
            &intent.city,
            &intent.bucket_label,
            intent.side.as_str(),
            &price,
            &size_usd,
            result.status.as_str(),
            &fill_price,
            &fill_size,
            &result.error_message,
        ];
        writer.write_record(record)?;
        writer.flush()?;

        Ok(())
    }
}

fn writer(file: File) -> csv::Writer<File> {
    csv::WriterBuilder::new().has_headers(false).from_writer(file)
}
