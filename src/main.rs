use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docsync::api;
use docsync::config::{Environment, ServerConfig};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "Collaborative document editing server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (default)
    Serve {
        /// Port for HTTP and realtime traffic; overrides PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply database migrations and exit
    Migrate,
}

fn init_tracing(environment: Environment) {
    let default = match environment {
        Environment::Production => "docsync=info,tower_http=info",
        _ => "docsync=debug,tower_http=debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Log panics anywhere in the process and exit without a graceful close.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("Uncaught panic: {}\n{}", info, backtrace);
        std::process::exit(1);
    }));
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(config.environment);
    install_panic_hook();

    if config.uses_development_secret() {
        tracing::warn!("JWT_SECRET is not set; using the development secret");
    }

    let result = match cli.command {
        Some(Commands::Migrate) => migrate(&config),
        Some(Commands::Serve { port }) => {
            if let Some(port) = port {
                config.port = port;
            }
            api::serve(config).await
        }
        None => api::serve(config).await,
    };

    if let Err(e) = result {
        tracing::error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn migrate(config: &ServerConfig) -> anyhow::Result<()> {
    api::open_store(config)?;
    tracing::info!("Migrations applied");
    Ok(())
}
