//! arm-rs CLI application entry point.
//!
//! Runs the monitor headless: it connects to Tor, keeps the connection,
//! circuit and log tables current, and periodically logs a summary line.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐      ┌─────────────────┐
//!   │ --generate_config│────▶ │ Write default   │────▶ Exit
//!   │    specified?    │      │ config & exit   │
//!   └────────┬─────────┘      └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Run Monitor     │ ◄── monitor::run_main()
//!   └─────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```bash
//! # Default control socket, then 127.0.0.1:9051
//! arm-rs
//!
//! # Control socket with a cookie file
//! arm-rs --control-socket /run/tor/control --cookie /run/tor/control.authcookie
//!
//! # Force a connection lookup tool and allow hostname lookups
//! arm-rs --resolver ss --enable-name-lookups
//!
//! # Log to syslog
//! arm-rs --logfile :syslog:
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `ARM_CONFIG` | Path to config file (equivalent to `--config`) |
//! | `RUST_LOG` | Overrides the log filter |

use clap::Parser;
use std::process::ExitCode;

use arm_rs::{config, logger, monitor, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> arm_rs::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("arm-rs {} starting", monitor::VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("Control IP: {}", config.control_ip),
    );
    if let Some(ref cmd) = config.resolver.resolver_override {
        logger::plog(LogLevel::Info, &format!("Connection resolver forced to {}", cmd));
    }
    if config.resolver.name_lookups {
        logger::plog(LogLevel::Info, "Hostname lookups enabled");
    }

    monitor::run_main(config).await
}
