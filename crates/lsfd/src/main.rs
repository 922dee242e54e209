//! lsfd: the lsf daemon.
//!
//! # Usage
//!
//! ```text
//! lsfd run --config lsf.toml --data-dir /var/lib/lsf --apps apps.json
//! lsfd plan --config lsf.toml --app app.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lsf_core::LsfConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "lsfd", about = "lsf layout planner and latency controller")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until Ctrl-C.
    Run {
        /// Path to lsf.toml.
        #[arg(long, default_value = "lsf.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/lsf")]
        data_dir: PathBuf,

        /// JSON file with app specs to register at start-up.
        #[arg(long)]
        apps: Option<PathBuf>,

        /// JSON file mapping app ids to runtimes in milliseconds.
        #[arg(long)]
        telemetry_file: Option<PathBuf>,
    },
    /// Print the layout candidates of one app as JSON.
    Plan {
        /// Path to lsf.toml.
        #[arg(long, default_value = "lsf.toml")]
        config: PathBuf,

        /// JSON file with the app spec.
        #[arg(long)]
        app: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            apps,
            telemetry_file,
        } => {
            let config = LsfConfig::from_file(&config)?;
            info!(nodes = config.platform.nodes.len(), "lsf daemon starting");
            let options = lsfd::DaemonOptions {
                data_dir,
                apps,
                telemetry_file,
            };
            lsfd::run_daemon(config, options, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
            })
            .await
        }
        Command::Plan { config, app } => {
            let config = LsfConfig::from_file(&config)?;
            config.validate()?;
            let planner = lsfd::build_planner(&config);
            let mut output = serde_json::Map::new();
            for spec in lsfd::load_app_specs(&app)? {
                let candidates = lsfd::plan_app(&planner, &config, &spec)?;
                output.insert(spec.name.clone(), serde_json::to_value(candidates)?);
            }
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lsfd=debug,lsf=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
