use serde::Serialize;
use shopwire_core::{GatewayConfig, GatewayStatus, Orchestrator};

use super::CommandResult;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct StatusView {
    call_timeout_ms: u64,
    max_retries: u32,
    #[serde(flatten)]
    gateway: GatewayStatus,
}

pub async fn run(
    orchestrator: &Orchestrator,
    config: &GatewayConfig,
) -> Result<CommandResult, CliError> {
    let view = StatusView {
        call_timeout_ms: config.call_timeout_ms,
        max_retries: config.retry.max_retries,
        gateway: orchestrator.status().await,
    };
    Ok(CommandResult::ok(serde_json::to_value(&view)?))
}
