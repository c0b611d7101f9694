//! devshell - virtual terminal sessions for a browser IDE.
//!
//! Usage:
//!   devshell serve [--port 3001]                     # Start HTTP server
//!   devshell --run [--session ID] -- <command line>  # Run one command

mod config;
mod dispatch;
mod error;
mod executor;
mod http_server;
mod open;
mod paths;
mod remote;
mod sandbox;
mod state;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "devshell")]
#[command(about = "Virtual terminal sessions with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project root every session is sandboxed to
    #[arg(long, env = "DEVSHELL_ROOT", default_value = ".")]
    root: PathBuf,

    /// Command timeout in milliseconds
    #[arg(long, env = "DEVSHELL_TIMEOUT_MS", default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Maximum combined stdout/stderr size in bytes
    #[arg(
        long,
        env = "DEVSHELL_MAX_OUTPUT_BYTES",
        default_value_t = config::DEFAULT_MAX_OUTPUT_BYTES
    )]
    max_output_bytes: usize,

    /// Timeout for launching companion applications from `open`
    #[arg(
        long,
        env = "DEVSHELL_OPEN_TIMEOUT_MS",
        default_value_t = config::DEFAULT_OPEN_TIMEOUT_MS
    )]
    open_timeout_ms: u64,

    /// Evict sessions idle for this many seconds (0 keeps them forever)
    #[arg(long, env = "DEVSHELL_SESSION_TTL_SECS", default_value = "0")]
    session_ttl_secs: u64,

    /// Run one command line and exit
    #[arg(long)]
    run: bool,

    /// Session id used with --run
    #[arg(long, default_value = state::DEFAULT_SESSION_ID)]
    session: String,

    /// Virtual working directory used with --run
    #[arg(long)]
    cwd: Option<String>,

    /// Command line to run
    #[arg(last = true)]
    cmd_args: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "DEVSHELL_PORT", default_value = "3001")]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match config::Config::new(&args.root) {
        Ok(config) => config
            .with_limits(args.timeout_ms, args.max_output_bytes)
            .with_open_timeout(args.open_timeout_ms)
            .with_session_ttl(args.session_ttl_secs),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };
    let state = state::AppState::new(config);

    match args.command {
        Some(Commands::Serve { port }) => {
            if let Err(e) = http_server::run_server(port, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        None if args.run => {
            if args.cmd_args.is_empty() {
                eprintln!("Error: No command specified");
                exit(1);
            }
            let request = dispatch::CommandRequest {
                session_id: args.session,
                command: args.cmd_args.join(" "),
                cwd: args.cwd,
            };
            match state.dispatcher.dispatch(request).await {
                Ok(result) => {
                    print!("{}", result.output);
                    if !result.output.is_empty() && !result.output.ends_with('\n') {
                        println!();
                    }
                    exit(result.exit_code);
                }
                Err(rejection) => {
                    eprintln!("Error: {}", rejection.error);
                    exit(rejection.error.exit_code());
                }
            }
        }
        None => {
            eprintln!("Error: Use 'serve' subcommand or --run flag");
            exit(1);
        }
    }
}
