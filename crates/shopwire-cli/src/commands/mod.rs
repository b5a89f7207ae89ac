mod details;
mod search;
mod status;

use std::sync::Arc;

use serde_json::Value;
use shopwire_core::{
    ConfigLoader, EnvCredentialSource, ErrorReport, FixtureSource, GatewayConfig, JsonApiSource,
    Orchestrator, OrchestratorBuilder, ProductSource, ProviderId, RequestOptions,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::{Envelope, Meta};

/// Providers served from the built-in catalogue when `--offline` runs without any configured.
pub const OFFLINE_PROVIDERS: [&str; 2] = ["shopapi", "scraper"];

pub struct CommandResult {
    pub request_id: Option<Uuid>,
    pub data: Value,
    pub warnings: Vec<String>,
    pub errors: Vec<ErrorReport>,
    pub failed: bool,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            request_id: None,
            data,
            warnings: Vec::new(),
            errors: Vec::new(),
            failed: false,
        }
    }

    pub fn failed(data: Value, errors: Vec<ErrorReport>) -> Self {
        Self {
            errors,
            failed: true,
            ..Self::ok(data)
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    fn into_envelope(self, command: &'static str, latency_ms: u64) -> Envelope {
        Envelope {
            meta: Meta {
                request_id: self.request_id.unwrap_or_else(Uuid::new_v4),
                command,
                latency_ms,
                warnings: self.warnings,
            },
            data: self.data,
            errors: self.errors,
            failed: self.failed,
        }
    }
}

pub async fn run(cli: &Cli) -> Result<Envelope, CliError> {
    let config = load_config(cli)?;
    let orchestrator = build_orchestrator(&config, cli.offline)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_interrupt(cancel.clone());
    let options = RequestOptions::default()
        .with_priority(cli.priority)
        .with_cancellation(cancel.clone());

    let started = Instant::now();
    let (command, result) = match &cli.command {
        Command::Search(args) => ("search", search::run(args, &orchestrator, &options).await),
        Command::Details(args) => ("details", details::run(args, &orchestrator, &options).await),
        Command::Status => ("status", status::run(&orchestrator, &config).await),
    };
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    cancel.cancel();
    interrupt.abort();

    Ok(result?.into_envelope(command, latency_ms))
}

/// Reads the configuration file and environment, then applies command-line overrides.
pub fn load_config(cli: &Cli) -> Result<GatewayConfig, CliError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }

    let mut config = loader.load()?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config.call_timeout_ms = timeout_ms;
    }
    if cli.demo {
        config.quota.demo_mode = true;
    }
    config.validate()?;
    Ok(config)
}

pub fn build_orchestrator(config: &GatewayConfig, offline: bool) -> Result<Orchestrator, CliError> {
    let mut builder = OrchestratorBuilder::from_config(config);
    for source in build_sources(config, offline)? {
        builder = builder.with_source(source);
    }
    Ok(builder.build())
}

fn build_sources(
    config: &GatewayConfig,
    offline: bool,
) -> Result<Vec<Arc<dyn ProductSource>>, CliError> {
    if config.providers.is_empty() {
        if !offline {
            return Err(CliError::Command(
                "no providers configured; add a [providers.<name>] section or pass --offline"
                    .to_owned(),
            ));
        }
        return OFFLINE_PROVIDERS
            .iter()
            .map(|name| offline_source(ProviderId::parse(name)?))
            .collect();
    }

    let credentials = Arc::new(EnvCredentialSource);
    let mut sources: Vec<Arc<dyn ProductSource>> = Vec::with_capacity(config.providers.len());
    for (name, settings) in &config.providers {
        let provider = ProviderId::parse(name)?;
        if offline {
            sources.push(offline_source(provider)?);
            continue;
        }

        let Some(base_url) = &settings.base_url else {
            return Err(CliError::Command(format!(
                "provider '{provider}' has no base_url; set one or pass --offline"
            )));
        };
        let mut source = JsonApiSource::new(provider, base_url, credentials.clone())
            .with_timeout(config.call_timeout());
        if let Some(header) = &settings.api_key_header {
            source = source.with_api_key_header(header);
        }
        sources.push(Arc::new(source));
    }

    Ok(sources)
}

fn offline_source(provider: ProviderId) -> Result<Arc<dyn ProductSource>, CliError> {
    Ok(Arc::new(FixtureSource::new(provider)?))
}

fn cancel_on_interrupt(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    warn!("interrupted; cancelling outstanding provider calls");
                    cancel.cancel();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("shopwire").chain(args.iter().copied()))
            .expect("arguments parse")
    }

    #[test]
    fn offline_without_providers_uses_builtin_catalogue() {
        let orchestrator =
            build_orchestrator(&GatewayConfig::default(), true).expect("offline gateway builds");
        let names = orchestrator
            .providers()
            .iter()
            .map(|provider| provider.as_str().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(names, OFFLINE_PROVIDERS);
    }

    #[test]
    fn online_without_providers_is_a_command_error() {
        let error = build_orchestrator(&GatewayConfig::default(), false).expect_err("no providers");
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn online_provider_requires_base_url() {
        let mut config = GatewayConfig::default();
        config.providers.insert("shopapi".to_owned(), Default::default());

        assert!(matches!(
            build_orchestrator(&config, false),
            Err(CliError::Command(message)) if message.contains("base_url")
        ));
        assert!(build_orchestrator(&config, true).is_ok());
    }

    #[test]
    fn flags_override_file_settings() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(file, "call_timeout_ms = 2500\n\n[providers.shopapi]\nbase_url = \"https://api.shop.test\"")
            .expect("write config");
        let path = file.path().to_string_lossy().into_owned();

        let config = load_config(&cli(&["--config", &path, "--timeout-ms", "750", "--demo", "status"]))
            .expect("config loads");
        assert_eq!(config.call_timeout_ms, 750);
        assert!(config.quota.demo_mode);
        assert!(config.providers.contains_key("shopapi"));
    }

    #[test]
    fn zero_timeout_override_is_rejected() {
        let error = load_config(&cli(&["--timeout-ms", "0", "status"])).expect_err("invalid timeout");
        assert_eq!(error.exit_code(), 2);
    }

    #[tokio::test]
    async fn offline_search_renders_merged_results() {
        let envelope = run(&cli(&["--offline", "search", "kettle"]))
            .await
            .expect("search runs");

        assert!(!envelope.failed);
        assert_eq!(envelope.meta.command, "search");
        let records = envelope.data["records"].as_array().expect("records array");
        assert!(!records.is_empty());
        assert!(envelope.errors.is_empty());
    }

    #[tokio::test]
    async fn demo_search_fails_every_provider() {
        let envelope = run(&cli(&["--offline", "--demo", "search", "kettle"]))
            .await
            .expect("command completes");

        assert!(envelope.failed);
        assert_eq!(envelope.errors.len(), OFFLINE_PROVIDERS.len());
        assert!(envelope.errors.iter().all(|error| error.code == "provider.demo_mode"));
    }
}
