use std::path::PathBuf;

use clap::Parser;

/// Long-running daemon bridging this device to an operator over a
/// persistent duplex connection.
#[derive(Parser, Debug)]
#[command(
    name = "agentd",
    version,
    about = "Edge agent runtime bridging a device to an operator",
    long_about = "agentd maintains a persistent, auto-reconnecting connection to an \
        operator endpoint, executes tasks it receives (shell commands, scripts, file \
        operations, service control) under a bounded-concurrency executor, runs an \
        internal scheduler for delayed/recurring work, and reports periodic telemetry \
        heartbeats.\n\n\
        Configuration is resolved from a TOML file (searched in the usual locations, \
        or given explicitly with --config), then overridden by AGENT_* environment \
        variables, then by the flags below.",
    term_width = 100
)]
pub struct Cli {
    /// Path to a config file (overrides the usual search order)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Operator WebSocket URL, overriding the config file and AGENT_OPERATOR_URL
    #[arg(long)]
    pub operator_url: Option<String>,

    /// Agent id, overriding the config file and AGENT_ID
    #[arg(long)]
    pub agent_id: Option<String>,

    /// Log verbosity (`error`, `warn`, `info`, `debug`, `trace`, or an
    /// `EnvFilter` directive string)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write a default config file to the platform config directory (or
    /// --config, if given) and exit
    #[arg(long)]
    pub init_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_with_no_arguments() {
        let cli = Cli::try_parse_from(["agentd"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.init_config);
    }

    #[test]
    fn parses_operator_url_flag() {
        let cli = Cli::try_parse_from(["agentd", "--operator-url", "wss://op.example.com"]).unwrap();
        assert_eq!(cli.operator_url.as_deref(), Some("wss://op.example.com"));
    }

    #[test]
    fn parses_short_config_flag() {
        let cli = Cli::try_parse_from(["agentd", "-c", "/etc/agentd.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/agentd.toml")));
    }
}
