use shopwire_core::{ErrorReport, Orchestrator, ProviderId, RequestOptions, SearchRequest};

use super::CommandResult;
use crate::cli::SearchArgs;
use crate::error::CliError;

pub async fn run(
    args: &SearchArgs,
    orchestrator: &Orchestrator,
    options: &RequestOptions,
) -> Result<CommandResult, CliError> {
    let request = SearchRequest::new(args.query.as_str())?;
    let outcome = if args.providers.is_empty() {
        orchestrator.search_all(&request, options).await
    } else {
        let providers = args
            .providers
            .iter()
            .map(|name| ProviderId::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        orchestrator
            .search_providers(&providers, &request, options)
            .await
    };

    match outcome {
        Ok(outcome) => {
            let errors = outcome
                .failed_providers()
                .filter_map(|report| report.error.clone())
                .collect::<Vec<ErrorReport>>();
            let mut result = CommandResult::ok(serde_json::to_value(&outcome)?)
                .with_request_id(outcome.request_id);
            for report in outcome.failed_providers() {
                result = result.with_warning(format!(
                    "provider '{}' returned no results",
                    report.provider
                ));
            }
            result.errors = errors;
            Ok(result)
        }
        Err(failure) => {
            let errors = failure
                .providers
                .iter()
                .filter_map(|report| report.error.clone())
                .collect();
            Ok(CommandResult::failed(serde_json::to_value(&failure)?, errors)
                .with_request_id(failure.request_id)
                .with_warning(failure.to_string()))
        }
    }
}
