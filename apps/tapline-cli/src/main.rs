//! # Tapline CLI Entry Point
//!
//! Drives a card reader from the terminal: discover readers, connect to one
//! and take a payment.
//!
//! ## Application Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           tapline (binary)                              │
//! │                                                                         │
//! │  main.rs ────► tracing, config, wiring                                  │
//! │                    │                                                    │
//! │                    ▼                                                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │ SessionController                                                │  │
//! │  │   ReaderSession ──► SimulatedTerminal                            │  │
//! │  │   PaymentOrchestrator ──► HttpBackend  (or StubBackend offline)  │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//! - `tapline discover` - Scan and list readers
//! - `tapline pay --amount 250 --reference 1024` - Connect and charge
//! - `tapline config show|init` - Print or write the configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tapline_core::{ErrorReason, Reader};
use tapline_terminal::{
    BackendGateway, HttpBackend, PlatformContext, SessionController, SessionError, SessionState,
    SimulatedTerminal, StubBackend, TerminalConfig,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(author, version, about = "Card reader payments from the command line", long_about = None)]
struct Cli {
    /// Path to terminal.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Merchant backend base URL
    #[arg(long, global = true, env = "TAPLINE_BACKEND_URL")]
    backend_url: Option<String>,

    /// Use an in-memory backend instead of HTTP
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for readers and print them
    Discover {
        /// Seconds to scan before printing
        #[arg(long, default_value_t = 3)]
        wait_secs: u64,
    },

    /// Connect to a reader and take a payment
    Pay {
        /// Amount in major units, e.g. 250.50
        #[arg(long)]
        amount: String,

        /// Merchant reference number (digits only)
        #[arg(long)]
        reference: String,

        /// Reader serial number (defaults to the first one found)
        #[arg(long)]
        reader: Option<String>,

        /// Seconds to wait for readers to show up
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Inspect or write the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration to disk
    Init,
}

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = TerminalConfig::load(cli.config.clone())?;
    if let Some(url) = &cli.backend_url {
        config.backend.url = url.clone();
        config.validate()?;
    }
    debug!(backend = %config.backend.url, simulated = config.discovery.simulated, "Configuration loaded");

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigAction::Init => {
                config.save(cli.config)?;
                println!("Configuration written");
            }
        },
        Command::Discover { wait_secs } => {
            let controller = build_controller(&config, cli.offline)?;
            controller.initialize(&PlatformContext::default())?;
            discover(&controller, Duration::from_secs(wait_secs)).await?;
        }
        Command::Pay {
            amount,
            reference,
            reader,
            wait_secs,
        } => {
            let controller = build_controller(&config, cli.offline)?;
            controller.initialize(&PlatformContext::default())?;
            pay(&controller, &amount, &reference, reader, Duration::from_secs(wait_secs)).await?;
        }
    }

    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tapline_terminal=trace` - Trace the terminal crate only
/// - Default: INFO, DEBUG for tapline crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tapline=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_controller(config: &TerminalConfig, offline: bool) -> CliResult<SessionController> {
    if !config.discovery.simulated {
        return Err(SessionError::InvalidConfig(
            "no hardware reader SDK is linked into this build, set discovery.simulated = true"
                .into(),
        )
        .into());
    }

    let backend: Arc<dyn BackendGateway> = if offline {
        info!("Using in-memory backend");
        Arc::new(StubBackend::new())
    } else {
        info!(url = %config.backend.url, "Using merchant backend");
        Arc::new(HttpBackend::try_new(&config.backend.url)?.with_timeout(config.request_timeout()))
    };

    Ok(SessionController::from_config(
        Arc::new(SimulatedTerminal::new()),
        backend,
        config,
    ))
}

// =============================================================================
// Commands
// =============================================================================

async fn discover(controller: &SessionController, wait: Duration) -> CliResult<()> {
    controller.request_discovery()?;
    tokio::time::sleep(wait).await;
    controller.stop_discovery();

    let state = controller.state();
    if let Some(reason) = &state.last_error {
        return Err(report(reason));
    }
    if state.discovered_readers.is_empty() {
        println!("No readers found");
    }
    for reader in &state.discovered_readers {
        print_reader(reader);
    }
    Ok(())
}

async fn pay(
    controller: &SessionController,
    amount: &str,
    reference: &str,
    serial_number: Option<String>,
    wait: Duration,
) -> CliResult<()> {
    controller.set_amount(amount);
    controller.set_reference(reference);
    let form = controller.state();
    if form.amount_error.is_some() || form.reference_error.is_some() {
        return Err(SessionError::InvalidInput {
            amount: form.amount_error,
            reference: form.reference_error,
        }
        .into());
    }

    controller.request_discovery()?;
    let readers = wait_for_readers(controller.subscribe(), wait).await;
    let reader = match (&serial_number, readers.first()) {
        (Some(serial), _) => readers.iter().find(|r| &r.serial_number == serial).cloned(),
        (None, first) => first.cloned(),
    };
    let Some(reader) = reader else {
        controller.stop_discovery();
        if let Some(reason) = controller.state().last_error {
            return Err(report(&reason));
        }
        return Err(format!(
            "reader {} not found",
            serial_number.as_deref().unwrap_or("(any)")
        )
        .into());
    };

    println!("Connecting to {}", reader.display_name());
    controller.select_reader(&reader.serial_number).await?;
    controller.stop_discovery();

    let progress = tokio::spawn(print_progress(controller.subscribe()));
    let result = controller.request_payment().await;
    progress.abort();

    match result {
        Ok(()) => {
            println!("Payment completed");
            Ok(())
        }
        Err(SessionError::Payment(err)) if err.requires_reconciliation() => {
            warn!(stage = %err.stage, "Payment needs reconciliation");
            eprintln!("Card was charged but the capture failed; reconcile this payment manually");
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

// =============================================================================
// Output Helpers
// =============================================================================

async fn wait_for_readers(mut rx: watch::Receiver<SessionState>, wait: Duration) -> Vec<Reader> {
    let found = tokio::time::timeout(
        wait,
        rx.wait_for(|s| !s.discovered_readers.is_empty() || s.last_error.is_some()),
    )
    .await;

    match found {
        Ok(Ok(state)) => state.discovered_readers.clone(),
        _ => Vec::new(),
    }
}

async fn print_progress(mut rx: watch::Receiver<SessionState>) {
    let mut last = None;
    while rx.changed().await.is_ok() {
        let progress = rx.borrow_and_update().payment_progress;
        if progress.is_some() && progress != last {
            if let Some(step) = progress {
                println!("  {:?}", step);
            }
            last = progress;
        }
    }
}

fn print_reader(reader: &Reader) {
    match &reader.ip_address {
        Some(ip) => println!("{}  {}  {}", reader.serial_number, reader.display_name(), ip),
        None => println!("{}  {}", reader.serial_number, reader.display_name()),
    }
}

fn report(reason: &ErrorReason) -> Box<dyn std::error::Error> {
    format!("{}: {}", reason.title(), reason).into()
}
