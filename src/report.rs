//! JSON report persistence for xray and merge results.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

#[derive(Serialize)]
struct ReportEnvelope<'a, T: Serialize> {
    kind: &'a str,
    generated: String,
    data: &'a T,
}

/// Writes a pretty-printed JSON report wrapped in a small envelope.
pub fn save_report<T: Serialize>(kind: &str, data: &T, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create report file: {}", path.display()))?;
    let envelope = ReportEnvelope {
        kind,
        generated: chrono::Utc::now().to_rfc3339(),
        data,
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &envelope)
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    Ok(())
}
