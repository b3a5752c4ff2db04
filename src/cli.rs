use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Transport;

#[derive(Parser)]
#[command(
    name = "multi-mcp",
    version,
    about = "MCP multiplexing proxy that federates backend MCP servers behind one namespaced catalog"
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "config/multi-mcp.yaml")]
    pub config: PathBuf,

    /// Admin API host to reach for `refresh`/`status`/`list` (the running gateway's `--host`).
    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub host: String,

    /// Admin API port to reach for `refresh`/`status`/`list`.
    #[arg(long, global = true, default_value_t = 8808)]
    pub port: u16,

    /// Bearer token for the admin API, if the running gateway requires one.
    #[arg(long, global = true, env = "MULTIMCP_API_KEY")]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CliTransport {
    Stdio,
    Sse,
}

impl From<CliTransport> for Transport {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Stdio => Transport::Stdio,
            CliTransport::Sse => Transport::Sse,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway.
    Start {
        /// Upstream transport to serve on.
        #[arg(long, value_enum, default_value_t = CliTransport::Stdio)]
        transport: CliTransport,

        /// Host to bind the SSE transport's HTTP listener to.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind the SSE transport's HTTP listener to.
        #[arg(long, default_value_t = 8808)]
        port: u16,

        /// Bearer token required on every admin/SSE HTTP path. Unset disables auth.
        #[arg(long, env = "MULTIMCP_API_KEY")]
        api_key: Option<String>,

        /// Log level (trace, debug, info, warn, error). Overrides the
        /// configured `log_level` when given.
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Re-run discovery for one backend, or every backend if none is named.
    Refresh {
        /// Backend name to refresh. Omit to refresh all.
        server: Option<String>,
    },
    /// Show active and pending backends.
    Status,
    /// List known tools.
    List {
        /// Restrict the listing to one backend.
        #[arg(long)]
        server: Option<String>,
        /// Only show disabled (quarantined or admin-disabled) tools.
        #[arg(long)]
        disabled: bool,
    },
}

/// The gateway's config/state home directory: `$XDG_CONFIG_HOME/multi-mcp`,
/// falling back to `$HOME/.config/multi-mcp`.
pub fn config_home() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("multi-mcp")
}
