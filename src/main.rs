//! courierd: the push-notification broker server.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use courier::api::{self, ApiState};
use courier::broker::{Broker, BrokerConfig};
use courier::config::Config;
use courier::listener::{DeviceListener, SessionLimiter, load_tls_config};
use courier::session::{SessionConfig, run_session};
use courier::store::{InMemoryStore, PendingStore};
use courier::telemetry;

#[derive(Debug, Parser)]
#[command(name = "courierd", about = "Push-notification broker server")]
struct Cli {
    /// Path to the TOML configuration file; defaults apply without one.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose.saturating_add(1));

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn PendingStore> = Arc::new(InMemoryStore::new());
    let broker = Broker::start(
        Arc::clone(&store),
        BrokerConfig {
            unicast_enqueue_timeout: config.exchange_timeout(),
        },
    );
    let broker_handle = broker.handle();

    // The HTTP front door runs on its own tokio runtime; the device side of
    // the process stays threaded.
    let api_state = ApiState::new(
        Arc::clone(&store),
        Arc::new(broker_handle.clone()),
        config.max_request_body_bytes,
    );
    let http_addr = config.http_addr.clone();
    std::thread::Builder::new()
        .name("http-api".to_string())
        .spawn(move || match tokio::runtime::Runtime::new() {
            Ok(runtime) => {
                if let Err(err) = runtime.block_on(api::serve(api_state, &http_addr)) {
                    tracing::error!("http api failed: {err}");
                }
            }
            Err(err) => tracing::error!("could not start http runtime: {err}"),
        })?;

    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
        _ => None,
    };
    let device_listener = DeviceListener::bind(&config.addr, tls)?;
    tracing::info!("device listener on {}", device_listener.local_addr()?);

    let limiter = SessionLimiter::new(config.max_sessions);
    let session_config = SessionConfig {
        ping_interval: config.ping_interval(),
        exchange_timeout: config.exchange_timeout(),
        queue_size: config.session_queue_size,
    };
    let session_store = Arc::clone(&store);
    let result = device_listener.accept_loop(&limiter, move |conn| {
        run_session(
            conn,
            Arc::clone(&session_store),
            broker_handle.clone(),
            session_config,
        );
    });

    broker.shutdown();
    store.close();
    result?;
    Ok(())
}
