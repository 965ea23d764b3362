use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use sblock_core::{QueueSnapshot, RecoveryReport};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub const SCHEMA_BASE: &str = "https://schemas.3leaps.dev/sblock/cli/v1";

pub fn schema_id(name: &str) -> String {
    format!("{SCHEMA_BASE}/{name}.schema.json")
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// One row per descriptor, prefixed with the owning object.
pub fn add_queue_rows(table: &mut Table, owner: &str, queues: &[QueueSnapshot]) {
    for queue in queues {
        table.add_row(vec![
            owner.to_string(),
            queue.name.to_string(),
            queue.descriptor.to_string(),
            format!("{:#010x}", queue.base),
            queue.block_size.to_string(),
            queue.block_count.to_string(),
            queue.rdptr.to_string(),
            queue.wrptr.to_string(),
            queue.occupancy.to_string(),
        ]);
    }
}

pub const QUEUE_HEADER: [&str; 9] = [
    "OWNER", "QUEUE", "SLOT", "BASE", "SIZE", "COUNT", "RDPTR", "WRPTR", "OCC",
];

pub fn recovery_line(report: &RecoveryReport) -> String {
    format!(
        "discarded tx={} rx={} | pool tx={} rx={} | on loan tx={} rx={}",
        report.discarded_tx,
        report.discarded_rx,
        report.pool_tx,
        report.pool_rx,
        report.on_loan_tx,
        report.on_loan_rx
    )
}
