mod admin;
mod audit;
mod backend;
mod bootstrap;
mod cache;
mod cli;
mod config;
mod prompts;
mod registry;
mod resources;
mod retrieval;
mod router;
mod secrets;
mod server;
mod session;
mod ssrf;
mod trigger;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::{Config, Transport};

struct Gateway {
    registry: Arc<registry::ToolRegistry>,
    sessions: Arc<session::SessionManager>,
    router: Arc<router::RequestRouter>,
    retrieval: Option<Arc<retrieval::RetrievalPipeline>>,
    trigger: Arc<trigger::TriggerManager>,
    resolver: Arc<secrets::resolver::SecretResolver>,
    cache_path: std::path::PathBuf,
    config: Config,
    shutdown: Arc<tokio::sync::Notify>,
}

async fn initialize(config_path: &Path, log_level_override: Option<&str>) -> Result<Gateway> {
    config::load_dotenv();

    let home = cli::config_home();
    if !home.exists() {
        std::fs::create_dir_all(&home)?;
    }

    let mut config = Config::load(config_path)?;
    if let Some(level) = log_level_override {
        config.log_level = level.to_string();
    }

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let resolver = Arc::new(secrets::default_resolver(config.secrets.strict));
    config.resolve_secrets(&resolver)?;

    ssrf::init(config.ssrf.clone());

    info!(
        config_path = %config_path.display(),
        backends = config.backends.len(),
        "multi-mcp starting"
    );

    let registry = registry::ToolRegistry::new();

    let cache_path = config
        .cache_path
        .clone()
        .unwrap_or_else(cache::default_cache_path);

    let audit_path = config
        .audit_log_path
        .clone()
        .unwrap_or_else(audit::default_audit_log_path);
    let audit = Arc::new(audit::AuditLog::new(&audit_path)?);

    let shutdown = Arc::new(tokio::sync::Notify::new());

    let reg_for_disconnect = Arc::clone(&registry);
    let sessions = session::SessionManager::new(
        config.health.connection_semaphore,
        config.health.connect_deadline,
        move |name: &str| {
            reg_for_disconnect.mark_backend_stale(name);
        },
    );

    let retrieval = config.retrieval.enabled.then(|| {
        Arc::new(retrieval::RetrievalPipeline::new(
            Arc::clone(&registry),
            config.retrieval.clone(),
            Box::new(retrieval::logging::TracingLogger),
        ))
    });

    let router = router::RequestRouter::new(
        Arc::clone(&sessions),
        Arc::clone(&registry),
        Arc::clone(&audit),
        config.quarantine_threshold,
        cache_path.clone(),
        retrieval.clone(),
    );

    let trigger = Arc::new(trigger::TriggerManager::new(Arc::clone(&sessions), Arc::clone(&registry)));

    bootstrap::discover_all(&config, &sessions, &registry, &cache_path).await?;

    sessions.spawn_background_tasks(
        Arc::clone(&registry),
        config.health.idle_sweep_interval,
        config.health.watchdog_interval,
    );

    {
        let config_path = config_path.to_path_buf();
        let shared = Arc::new(arc_swap::ArcSwap::from_pointee(config.clone()));
        let sessions = Arc::clone(&sessions);
        let registry = Arc::clone(&registry);
        let cache_path = cache_path.clone();
        let resolver = Arc::clone(&resolver);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            config::watch_config(config_path, shared, sessions, registry, cache_path, resolver, shutdown).await;
        });
    }

    Ok(Gateway {
        registry,
        sessions,
        router,
        retrieval,
        trigger,
        resolver,
        cache_path,
        config,
        shutdown,
    })
}

async fn run_stdio(gw: Gateway) -> Result<()> {
    let server = server::GatewayServer::new(
        Arc::clone(&gw.registry),
        Arc::clone(&gw.router),
        gw.retrieval.clone(),
        Arc::clone(&gw.trigger),
    );

    info!("serving MCP over stdio");
    let service = server.serve(stdio()).await?;

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = service.waiting() => {
                if let Err(e) = result {
                    warn!(error = %e, "MCP service exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        service.waiting().await?;
    }

    shutdown_gateway(&gw).await;
    Ok(())
}

async fn run_sse(gw: Gateway, host: String, port: u16, api_key: Option<String>) -> Result<()> {
    let addr: std::net::SocketAddr = format!("{host}:{port}").parse()?;
    let api_key = api_key.unwrap_or_else(|| gw.config.admin.api_key.clone());

    let state = admin::AdminState {
        registry: Arc::clone(&gw.registry),
        sessions: Arc::clone(&gw.sessions),
        router: Arc::clone(&gw.router),
        resolver: Arc::clone(&gw.resolver),
        cache_path: gw.cache_path.clone(),
        api_key,
        debug: gw.config.admin.debug,
    };

    info!(%addr, "serving MCP over HTTP+SSE");
    let serve = admin::start(state, Arc::clone(&gw.trigger), gw.retrieval.clone(), addr, Arc::clone(&gw.shutdown));

    #[cfg(unix)]
    let result = {
        let shutdown_signal = Arc::clone(&gw.shutdown);
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        tokio::pin!(serve);
        tokio::select! {
            result = &mut serve => result,
            _ = sigterm.recv() => { info!("received SIGTERM"); shutdown_signal.notify_waiters(); serve.await }
            _ = sigint.recv() => { info!("received SIGINT"); shutdown_signal.notify_waiters(); serve.await }
        }
    };

    #[cfg(not(unix))]
    let result = serve.await;

    shutdown_gateway(&gw).await;
    result
}

async fn shutdown_gateway(gw: &Gateway) {
    info!("shutting down");
    gw.shutdown.notify_waiters();
    gw.sessions.stop_all().await;
    cache::save(&gw.cache_path, &gw.registry).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            transport,
            host,
            port,
            api_key,
            log_level,
        } => {
            let gw = initialize(&cli.config, log_level.as_deref()).await?;
            match Transport::from(transport) {
                Transport::Stdio => run_stdio(gw).await,
                _ => run_sse(gw, host, port, api_key).await,
            }
        }
        Command::Refresh { server } => admin_client::refresh(&cli, server).await,
        Command::Status => admin_client::status(&cli).await,
        Command::List { server, disabled } => admin_client::list(&cli, server, disabled).await,
    }
}

mod admin_client {
    use super::Cli;
    use anyhow::Result;
    use serde_json::Value;

    fn base_url(cli: &Cli) -> String {
        format!("http://{}:{}", cli.host, cli.port)
    }

    fn client(cli: &Cli) -> reqwest::Client {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &cli.api_key
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_default()
    }

    pub async fn refresh(cli: &Cli, server: Option<String>) -> Result<()> {
        let url = format!("{}/mcp_control", base_url(cli));
        let body = serde_json::json!({"server": server.unwrap_or_default(), "enabled": true});
        let resp = client(cli).post(url).json(&body).send().await?;
        println!("{}", resp.status());
        Ok(())
    }

    pub async fn status(cli: &Cli) -> Result<()> {
        let url = format!("{}/mcp_servers", base_url(cli));
        let resp: Value = client(cli).get(url).send().await?.json().await?;
        println!("{}", serde_json::to_string_pretty(&resp)?);
        Ok(())
    }

    pub async fn list(cli: &Cli, server: Option<String>, disabled: bool) -> Result<()> {
        let url = format!("{}/mcp_tools", base_url(cli));
        let resp: Value = client(cli).get(url).send().await?.json().await?;
        let Value::Array(tools) = resp else {
            println!("{resp}");
            return Ok(());
        };
        for tool in tools {
            let backend = tool.get("backend").and_then(Value::as_str).unwrap_or("");
            let enabled = tool.get("enabled").and_then(Value::as_bool).unwrap_or(true);
            if let Some(filter) = &server
                && backend != filter
            {
                continue;
            }
            if disabled && enabled {
                continue;
            }
            println!("{}", serde_json::to_string(&tool)?);
        }
        Ok(())
    }
}
