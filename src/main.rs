//! buildmaster CLI
//!
//! Entry point for the `buildmaster` master node.

use clap::{Parser, Subcommand};
use buildmaster::config::EffectiveConfig;
use buildmaster::master::{Backends, Master};
use buildmaster::telemetry::{init_logging, LogFormat};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "buildmaster")]
#[command(about = "Master coordination node for a distributed build platform", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master node
    Serve {
        /// Path to the TOML config file
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
        log_format: LogFormat,
    },

    /// Validate a config file and print the effective config (secrets redacted)
    CheckConfig {
        /// Path to the TOML config file
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, log_format } => run_serve(config, log_format),
        Commands::CheckConfig { config } => run_check_config(config),
    }
}

fn run_serve(config_path: PathBuf, log_format: LogFormat) {
    init_logging(log_format);

    let loaded = match EffectiveConfig::load(Some(&config_path), std::env::vars()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let backends = Backends::connect(&loaded.config).await?;
        let master = Master::start(loaded.config, backends).await?;
        tracing::info!(addr = %master.local_addr(), "master ready");
        master.run_until_ctrl_c().await
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run_check_config(config_path: PathBuf) {
    let loaded = match EffectiveConfig::load(Some(&config_path), std::env::vars()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    match loaded.effective.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }

    for name in loaded.config.insecure_endpoints() {
        eprintln!("warning: {} uses TLS without certificate validation", name);
    }
}
