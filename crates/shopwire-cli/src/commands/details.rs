use serde::Serialize;
use shopwire_core::{
    DetailsRequest, Orchestrator, Origin, ProductRecord, ProviderId, RequestOptions,
};

use super::CommandResult;
use crate::cli::DetailsArgs;
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct DetailsView {
    provider: ProviderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<Origin>,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    product: Option<ProductRecord>,
}

pub async fn run(
    args: &DetailsArgs,
    orchestrator: &Orchestrator,
    options: &RequestOptions,
) -> Result<CommandResult, CliError> {
    let provider = ProviderId::parse(&args.provider)?;
    let request = DetailsRequest::new(args.id.as_str())?;

    match orchestrator.details(&provider, &request, options).await {
        Ok(fetched) => {
            let view = DetailsView {
                provider,
                origin: Some(fetched.origin),
                attempts: fetched.attempts,
                product: Some(fetched.value),
            };
            Ok(CommandResult::ok(serde_json::to_value(&view)?))
        }
        Err(error) => {
            let view = DetailsView {
                provider,
                origin: None,
                attempts: 0,
                product: None,
            };
            Ok(CommandResult::failed(
                serde_json::to_value(&view)?,
                vec![orchestrator.error_report(&error)],
            ))
        }
    }
}
