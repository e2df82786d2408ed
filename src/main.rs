use clap::Parser;
use mockmongo::config::FileConfig;
use mockmongo::server::interactive_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let cfg_file_res = FileConfig::load(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => FileConfig::default(),
    };

    // Log filter precedence: CLI (--log-level / MOCKMONGO_LOG_LEVEL)
    // > RUST_LOG (env) > config file log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
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

    let mut options = cfg_file.into_options()?;
    if let Some(port) = cli.port {
        options.port = Some(port);
    }
    if options.port.is_none() {
        options.port = Some(27017);
    }
    options.verbose = !cli.quiet;

    let server = interactive_server(options);
    let addr = server.run().await?;
    tracing::info!(address = %addr, uri = %server.uri(), "mockmongo listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(name = "mockmongo", version, about = "Interactive mock MongoDB server")]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "MOCKMONGO_CONFIG")]
    config: Option<String>,

    /// Port on which the mock mongod listens (default 27017)
    #[arg(short = 'p', long = "port", env = "MOCKMONGO_PORT")]
    port: Option<u16>,

    /// Don't log requests and replies
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Log level or filter spec (e.g., info or info,mockmongo=debug)
    #[arg(long = "log-level", env = "MOCKMONGO_LOG_LEVEL")]
    log_level: Option<String>,
}
