use authgate::broker::{Broker, BrokerOptions};
use authgate::config::Config;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up LogLevel from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Determine log filter precedence: CLI (--log-level / AUTHGATE_LOG_LEVEL)
    // > RUST_LOG (env) > config LogLevel > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.web_service.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    let cfg = cfg_file.with_overrides(cli.max_startups.clone());

    let broker = Broker::new(
        cfg,
        BrokerOptions {
            cookie_insecure: cli.cookie_insecure,
            ssh_connector: None,
        },
    )?;
    tracing::info!("authentication broker ready");

    // Run until the broker has been idle for a full process-idle window.
    let mut idling = broker.subscribe_idling();
    while !*idling.borrow_and_update() {
        idling.changed().await?;
    }
    tracing::info!("no sessions remain, exiting");

    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "authgate",
    version,
    about = "Authentication broker for the admin gateway"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "AUTHGATE_CONFIG")]
    config: Option<String>,

    /// Log level or filter spec (e.g., info or info,authgate=debug)
    #[arg(long = "log-level", env = "AUTHGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Admission throttle as begin:rate:max (e.g., 10:100:10)
    #[arg(long = "max-startups", env = "AUTHGATE_MAX_STARTUPS")]
    max_startups: Option<String>,

    /// Omit the Secure attribute from session cookies
    #[arg(long = "cookie-insecure", env = "AUTHGATE_COOKIE_INSECURE")]
    cookie_insecure: bool,
}
