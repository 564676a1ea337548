//! Courier proxy binary.
//!
//! Loads configuration, initialises tracing and runs the proxy. Exit
//! codes: 0 on clean shutdown, 1 on fatal start-up failure, 2 when
//! topology creation is refused (coordinator role only).

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use courier_config::CourierConfig;
use courier_proxy::app;

#[derive(Parser, Debug)]
#[command(
    name = "courier",
    version,
    about = "Transparent A2A transport proxy over a session-ordered message bus"
)]
struct Args {
    /// Path to the TOML configuration file. `COURIER_*` environment
    /// variables override file values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    let cfg = match CourierConfig::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    match app::run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal start-up failure");
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
