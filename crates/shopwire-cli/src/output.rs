use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use shopwire_core::ErrorReport;
use uuid::Uuid;

/// Metadata attached to every command result.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub request_id: Uuid,
    pub command: &'static str,
    pub latency_ms: u64,
    pub warnings: Vec<String>,
}

/// Top-level JSON document written to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub meta: Meta,
    pub data: Value,
    pub errors: Vec<ErrorReport>,
    /// Set when no usable data came back; drives exit code 3.
    #[serde(skip)]
    pub failed: bool,
}

pub fn render(envelope: &Envelope, pretty: bool) -> Result<(), crate::error::CliError> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    write_json(&mut handle, envelope, pretty)?;
    handle.flush()?;
    Ok(())
}

fn write_json<W: Write>(
    writer: &mut W,
    envelope: &Envelope,
    pretty: bool,
) -> Result<(), crate::error::CliError> {
    if pretty {
        serde_json::to_writer_pretty(&mut *writer, envelope)?;
    } else {
        serde_json::to_writer(&mut *writer, envelope)?;
    }
    writeln!(writer)?;
    Ok(())
}
