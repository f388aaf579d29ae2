//
// main.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Main binary entry point for the kernel gateway.

#![allow(missing_docs)]

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Parser};
use kgserver::config::{default_username, GatewayConfig};
use kgserver::gateway::Gateway;
use kgserver::server;
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The port to bind the server to
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// The IP address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// The path to a log file. If specified, log output will be written to this
    /// file in addition to standard streams.
    #[arg(long)]
    log_file: Option<String>,

    /// The log level to use. Valid values are "trace", "debug", "info", "warn",
    /// and "error". If not specified, the default log level is "info", or the
    /// value of `RUST_LOG` if set.
    #[arg(short, long)]
    log_level: Option<String>,

    /// An additional directory to search for kernelspecs; may be given more
    /// than once. Searched before the standard Jupyter locations.
    #[arg(long = "kernel-path")]
    kernel_paths: Vec<PathBuf>,

    /// The directory kernel connection files are written to. Defaults to the
    /// system's temporary directory.
    #[arg(long)]
    connection_dir: Option<PathBuf>,

    /// Seconds to wait for a kernel to answer a shutdown request before it is
    /// shut down forcibly; 0 waits forever
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,

    /// The value of the Access-Control-Allow-Origin header on responses
    #[arg(long, default_value = "*")]
    cors_origin: String,
}

fn init_logging(args: &Args) {
    // Derive the log level
    let log_level = match args.log_level {
        Some(ref level) => level.to_string(),
        None => std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
    };

    let log_level = match log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            println!("Invalid log level '{}'; using 'info'", log_level);
            LevelFilter::Info
        }
    };

    match args.log_file {
        Some(ref log_file) => {
            let file = match File::create(log_file) {
                Ok(file) => file,
                Err(err) => {
                    println!("Failed to create log file '{}': {}", log_file, err);
                    std::process::exit(1);
                }
            };
            if let Err(err) = CombinedLogger::init(vec![
                TermLogger::new(
                    log_level,
                    Config::default(),
                    TerminalMode::Mixed,
                    ColorChoice::Auto,
                ),
                WriteLogger::new(log_level, Config::default(), file),
            ]) {
                println!(
                    "Failed to initialize combined file/terminal logging: {}",
                    err
                );
                std::process::exit(1);
            }
        }
        None => {
            if let Err(err) = TermLogger::init(
                log_level,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ) {
                println!("Failed to initialize terminal logging: {}", err);
                std::process::exit(1);
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let config = GatewayConfig {
        ip: args.ip.clone(),
        port: args.port,
        username: default_username(),
        kernel_paths: args.kernel_paths.clone(),
        connection_dir: args
            .connection_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir),
        shutdown_timeout: match args.shutdown_timeout {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        },
        cors_origin: args.cors_origin.clone(),
    };

    let listener = match std::net::TcpListener::bind(config.bind_address()) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", config.bind_address(), e);
            std::process::exit(1);
        }
    };

    println!(
        r#"
  Jupyter kernel gateway, version {}.
  Copyright (c) 2025, Posit Software PBC. All rights reserved.
"#,
        env!("CARGO_PKG_VERSION")
    );

    let gateway = Arc::new(Gateway::from_config(config));

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Received Ctrl-C; shutting down");
    };

    if let Err(e) = server::serve(gateway.clone(), listener, shutdown_signal).await {
        log::error!("Server error: {}", e);
    }

    gateway.shutdown_all().await;
}
