//! Command-line surface for the `shopwire` binary.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `search <query>` | Fan a product search out to every provider (or `--provider` picks) |
//! | `details <provider> <id>` | Fetch one product from one provider |
//! | `status` | Print quota, circuit and rate limit state |
//!
//! Global flags apply to every command. Results are written to stdout as JSON.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shopwire_core::RequestPriority;

#[derive(Debug, Parser)]
#[command(name = "shopwire", version, about = "Resilient product search across shopping providers")]
pub struct Cli {
    /// TOML configuration file (environment variables prefixed SHOPWIRE_ still apply).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Answer from the built-in offline catalogue instead of calling providers.
    #[arg(long, global = true, default_value_t = false)]
    pub offline: bool,

    /// Start in demo mode: no provider calls, cached data only.
    #[arg(long, global = true, default_value_t = false)]
    pub demo: bool,

    /// Admission tier against the global rate ceiling (normal or high).
    #[arg(long, global = true, default_value = "normal")]
    pub priority: RequestPriority,

    /// Override the per-attempt provider timeout.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Pretty-print JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search every configured provider and merge the results.
    Search(SearchArgs),
    /// Fetch a single product from one provider.
    Details(DetailsArgs),
    /// Show quota usage, circuit state and remaining rate limit capacity.
    Status,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Free-text product query.
    #[arg(required = true)]
    pub query: String,

    /// Restrict the search to these providers (repeatable).
    #[arg(long = "provider")]
    pub providers: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DetailsArgs {
    pub provider: String,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_with_repeated_providers_and_global_flags() {
        let cli = Cli::try_parse_from([
            "shopwire",
            "search",
            "espresso machine",
            "--provider",
            "shopapi",
            "--provider",
            "scraper",
            "--priority",
            "high",
            "--offline",
        ])
        .expect("arguments parse");

        assert!(cli.offline);
        assert_eq!(cli.priority, RequestPriority::High);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "espresso machine");
                assert_eq!(args.providers, vec!["shopapi", "scraper"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_priority() {
        let result = Cli::try_parse_from(["shopwire", "--priority", "urgent", "status"]);
        assert!(result.is_err());
    }

    #[test]
    fn details_takes_provider_and_id() {
        let cli = Cli::try_parse_from(["shopwire", "details", "shopapi", "kettle-1700", "--pretty"])
            .expect("arguments parse");
        assert!(cli.pretty);
        assert!(matches!(
            cli.command,
            Command::Details(DetailsArgs { ref provider, ref id }) if provider == "shopapi" && id == "kettle-1700"
        ));
    }
}
