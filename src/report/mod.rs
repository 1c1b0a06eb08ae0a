use std::io::Write;
use std::time::SystemTime;

use crate::clock::format_hms;
use crate::drain::snapshot::MetricsSnapshot;

/// Width of the banner rule.
const RULE_WIDTH: usize = 100;

/// Column titles in print order.
const COLUMNS: [&str; 9] = [
    "TIMESTAMP",
    "CTX_SW_G",
    "CTX_SW_F",
    "MEM_ALLOC",
    "PAGE_FTS",
    "FS_READ_CT",
    "FS_READ_KB",
    "FS_WRT_CT",
    "FS_WRT_KB",
];

/// Prints one fixed-width table row per drained bucket.
///
/// Output failures never reach the drain loop; they are logged at debug
/// level and dropped.
pub struct DiagnosticReporter {
    out: Box<dyn Write + Send>,
}

impl DiagnosticReporter {
    /// Creates a reporter writing to `out`.
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    /// Creates a reporter writing to stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Prints the start banner followed by the column header.
    pub fn banner(&mut self, now: SystemTime) {
        let rule = "=".repeat(RULE_WIDTH);
        let text = format!(
            "\n{rule}\nProfiling start: {}\n{rule}\n{}\n",
            format_hms(now),
            header_line(),
        );
        self.emit(&text);
    }

    /// Prints the row for one snapshot.
    pub fn report(&mut self, snapshot: &MetricsSnapshot) {
        let mut line = format_row(snapshot);
        line.push('\n');
        self.emit(&line);
    }

    fn emit(&mut self, text: &str) {
        let result = self
            .out
            .write_all(text.as_bytes())
            .and_then(|()| self.out.flush());

        if let Err(e) = result {
            tracing::debug!(error = %e, "diagnostic output failed");
        }
    }
}

/// Column header line.
pub fn header_line() -> String {
    row(COLUMNS.map(str::to_string))
}

/// Formats one snapshot as a table row.
pub fn format_row(snapshot: &MetricsSnapshot) -> String {
    let r = &snapshot.record;
    row([
        format_hms(snapshot.timestamp),
        r.ctx_switches_graceful.to_string(),
        r.ctx_switches_forced.to_string(),
        r.mem_bytes_allocated.to_string(),
        r.page_faults.to_string(),
        r.fs_read_count.to_string(),
        r.fs_read_size_kb.to_string(),
        r.fs_write_count.to_string(),
        r.fs_write_size_kb.to_string(),
    ])
}

fn row(cells: [String; 9]) -> String {
    let [ts, ctx_g, ctx_f, mem, pf, rd_ct, rd_kb, wr_ct, wr_kb] = cells;
    format!(
        "{ts:<9} {ctx_g:<10} {ctx_f:<10} {mem:<10} {pf:<10} {rd_ct:<10} {rd_kb:<16} {wr_ct:<10} {wr_kb:<16}"
    )
}
