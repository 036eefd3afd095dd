//! mcp-lite: minimal MCP server and client over stdio.
//!
//! `mcp-lite serve` (the default) serves the `swift_echo` tool on stdin/stdout.
//! `mcp-lite client -- <command>` spawns a server and calls one of its tools.

use std::path::PathBuf;
use std::process::{ExitCode, Stdio};

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_lite::config::{self, Config};
use mcp_lite::echo::{EchoToolbox, ECHO_TOOL};
use mcp_lite::mcp::types::{Content, Implementation};
use mcp_lite::mcp::{ClientOptions, McpClient, McpError, McpServer, Transport};

/// Minimal MCP tool-invocation server and client.
#[derive(Parser, Debug)]
#[command(name = "mcp-lite")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo tool over stdin/stdout (default)
    Serve,

    /// Spawn a server, list its tools and call one
    Client {
        /// Tool to call
        #[arg(long, default_value = ECHO_TOOL)]
        tool: String,

        /// Message passed as the `message` argument
        #[arg(long, default_value = "Hello from mcp-lite")]
        message: String,

        /// Server command and its arguments
        #[arg(last = true, required = true, value_name = "SERVER_COMMAND")]
        server: Vec<String>,
    },
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr, stdout carries protocol traffic.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cfg: &Config) -> Result<(), McpError> {
    let mut server = McpServer::from_config(cfg).with_toolbox(&EchoToolbox);

    info!("MCP server ready, waiting for client connection...");
    server.serve(Transport::stdio()).await
}

async fn run_client(cfg: &Config, tool: &str, message: &str, server: &[String]) -> Result<(), McpError> {
    let Some((program, args)) = server.split_first() else {
        return Err(McpError::InvalidRequest("no server command given".to_string()));
    };

    info!(program = %program, "Spawning server");
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(McpError::Internal("child process has no stdio pipes".to_string()));
    };

    let options = ClientOptions {
        session: cfg.session.options(),
        request_timeout: cfg.session.request_timeout(),
        ..ClientOptions::default()
    };
    let client = McpClient::connect(
        Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        Transport::child(stdout, stdin),
        options,
    );

    let outcome = exercise(&client, tool, message).await;

    client.disconnect().await;
    match child.wait().await {
        Ok(status) => info!(%status, "Server exited"),
        Err(e) => error!(error = %e, "Failed to wait for server"),
    }

    outcome
}

async fn exercise(client: &McpClient, tool: &str, message: &str) -> Result<(), McpError> {
    let server = client.initialize().await?;
    println!(
        "Connected to {} {} (protocol {})",
        server.server_info.name, server.server_info.version, server.protocol_version
    );

    for descriptor in client.list_tools().await? {
        println!("- {}: {}", descriptor.name, descriptor.description);
    }

    let result = client.call_tool(tool, json!({ "message": message })).await?;
    let label = if result.is_error { "Tool error" } else { "Result" };
    for item in &result.content {
        match item {
            Content::Text { text } => println!("{label}: {text}"),
            other => println!("{label}: {other:?}"),
        }
    }

    Ok(())
}

/// Entry point for mcp-lite.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nLoaded from default location: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // Display GPL license notice (required by GPLv3 Section 5d)
    eprintln!(
        "mcp-lite {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!("Source: {}", env!("CARGO_PKG_REPOSITORY"));
    eprintln!();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                "Starting mcp-lite server"
            );
            runtime.block_on(serve(&cfg))
        }
        Command::Client {
            tool,
            message,
            server,
        } => runtime.block_on(run_client(&cfg, &tool, &message, &server)),
    };

    // A pending stdin read sits on a blocking thread and cannot be interrupted
    runtime.shutdown_background();

    match result {
        Ok(()) => {
            info!("Shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
