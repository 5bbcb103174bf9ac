use crate::config::ServerConfig;
use crate::echo::{discard_handler, echo_handler};
use crate::server::{Server, StopHandle};
use crate::worker_pool::BackpressureMode;
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_WORKERS: usize = 4;

/// Command-line interface for poolserver
#[derive(Parser)]
#[command(name = "poolserver", version)]
#[command(about = "Bounded worker-pool TCP server", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the server until SIGINT/SIGTERM
    Serve {
        /// Configuration file (YAML, or TOML with a .toml extension)
        #[arg(short, long, env = "POOLSRV_CONFIG")]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: ServeOverrides,

        /// Built-in handler to run for each connection
        #[arg(long, value_enum, default_value_t = HandlerKind::Echo)]
        handler: HandlerKind,
    },
    /// Load and validate a configuration file, then print the effective settings
    CheckConfig {
        /// Configuration file (YAML, or TOML with a .toml extension)
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Flags that take precedence over the environment and the config file
#[derive(Debug, Default, Clone, clap::Args)]
pub struct ServeOverrides {
    /// Address to listen on (host:port)
    #[arg(short, long)]
    pub addr: Option<String>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum time the accept loop waits before re-checking for a stop request
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Bound the connection queue (unbounded if not given)
    #[arg(long)]
    pub queue_bound: Option<usize>,

    /// What to do when a bounded queue is full: block or shed
    #[arg(long, value_parser = parse_backpressure)]
    pub backpressure: Option<BackpressureMode>,

    /// Worker thread stack size in bytes (decimal or 0x hex)
    #[arg(long, value_parser = crate::config::parse_stack_size)]
    pub stack_size: Option<usize>,
}

impl ServeOverrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(addr) = &self.addr {
            config.listen_address = addr.clone();
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.shutdown_poll_interval_ms = ms;
        }
        if let Some(bound) = self.queue_bound {
            config.queue_bound = Some(bound);
        }
        if let Some(mode) = self.backpressure {
            config.backpressure_mode = mode;
        }
        if let Some(size) = self.stack_size {
            config.worker_stack_size = Some(size);
        }
    }
}

/// Built-in connection handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HandlerKind {
    /// Write back everything the client sends
    Echo,
    /// Read and drop everything the client sends
    Discard,
}

fn parse_backpressure(s: &str) -> Result<BackpressureMode, String> {
    BackpressureMode::from_str(s).ok_or_else(|| format!("expected `block` or `shed`, got `{s}`"))
}

/// Layer defaults, config file, environment and flags (lowest to highest),
/// then validate.
pub fn load_config(
    file: Option<&Path>,
    overrides: &ServeOverrides,
) -> anyhow::Result<ServerConfig> {
    let mut config = match file {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::new(DEFAULT_LISTEN_ADDRESS, DEFAULT_WORKERS),
    };
    config.apply_env();
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Run the parsed command
pub fn run_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve {
            config,
            overrides,
            handler,
        } => {
            let config = load_config(config.as_deref(), &overrides)?;
            serve(config, handler)
        }
        Commands::CheckConfig { config } => {
            let mut loaded = ServerConfig::from_file(&config)?;
            loaded.apply_env();
            loaded
                .validate()
                .with_context(|| format!("{} is not a usable configuration", config.display()))?;
            print!("{}", loaded.to_yaml()?);
            Ok(())
        }
    }
}

fn serve(config: ServerConfig, handler: HandlerKind) -> anyhow::Result<()> {
    let builder = Server::builder(config);
    let builder = match handler {
        HandlerKind::Echo => builder.handler(echo_handler),
        HandlerKind::Discard => builder.handler(discard_handler),
    };
    let server = builder.build()?;
    server.start().context("failed to start server")?;

    let signals = SignalGuard::install(server.stop_handle())?;
    let served = server.serve_forever();
    drop(signals);
    served?;

    let snapshot = server.metrics().snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("failed to serialize metrics")?
    );
    Ok(())
}

/// Forwards SIGINT/SIGTERM to a [`StopHandle`] from a dedicated thread.
/// Dropping it unregisters the handlers and ends the thread.
struct SignalGuard {
    #[cfg(unix)]
    handle: signal_hook::iterator::Handle,
}

impl SignalGuard {
    #[cfg(unix)]
    fn install(stop: StopHandle) -> anyhow::Result<Self> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
        let handle = signals.handle();
        std::thread::Builder::new()
            .name("poolsrv-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "received shutdown signal");
                    stop.request_stop();
                }
            })
            .context("failed to spawn signal thread")?;
        Ok(Self { handle })
    }

    #[cfg(not(unix))]
    fn install(_stop: StopHandle) -> anyhow::Result<Self> {
        tracing::warn!("signal handling is not supported on this platform");
        Ok(Self {})
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.handle.close();
    }
}
