//! # Headless Engine Runner
//!
//! Runs the synchronization engine without a presentation layer and logs
//! every state transition. Useful for soak-testing the channels against a
//! dispatch environment and for watching what a driver device would see.
//!
//! ## Usage
//! ```bash
//! # Run against the endpoints in the default config file
//! DROVER_WORKER_ID=42 cargo run -p drover-engine --bin headless
//!
//! # Explicit config file, go online immediately
//! cargo run -p drover-engine --bin headless -- --config ./drover.toml --online
//! ```
//!
//! Log verbosity follows `RUST_LOG` (`info,drover=debug` by default).

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drover_engine::{EngineConfig, EngineSnapshot, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut go_online = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--online" => {
                go_online = true;
            }
            "--help" | "-h" => {
                println!("Drover Headless Engine Runner");
                println!();
                println!("Usage: headless [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Engine config file (default: platform config dir)");
                println!("      --online         Report the worker online at startup");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    init_tracing();

    let config = EngineConfig::load(config_path)?;
    info!(
        worker = config.worker.id,
        session = %config.endpoints.session_url,
        topic = %config.endpoints.topic_url,
        "Starting headless engine"
    );

    let engine = SyncEngine::spawn(config)?;

    if go_online {
        engine.set_online(true).await?;
    }

    let mut snapshots = engine.subscribe();
    let mut previous = snapshots.borrow().clone();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Engine stopped publishing; exiting");
                    break;
                }
                let current = snapshots.borrow_and_update().clone();
                log_transitions(&previous, &current);
                previous = current;
            }
            _ = &mut shutdown => {
                engine.shutdown().await;
                break;
            }
        }
    }

    info!("Headless runner stopped");
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,drover=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Logs what changed between two snapshots, one line per concern.
fn log_transitions(previous: &EngineSnapshot, current: &EngineSnapshot) {
    for view in &current.offers {
        let known = previous
            .offers
            .iter()
            .any(|p| p.offer.offer_id == view.offer.offer_id);
        if !known {
            info!(
                offer = %view.offer.offer_id,
                reward = view.offer.reward_points,
                expires_in = view.seconds_remaining,
                "Offer pending"
            );
        }
    }
    if current.offers.len() < previous.offers.len() {
        info!(pending = current.offers.len(), "Offer board shrank");
    }

    match (&previous.ride, &current.ride) {
        (None, Some(ride)) => {
            info!(ride = %ride.ride_id, status = %ride.status, "Ride active");
        }
        (Some(old), Some(new)) if old.status != new.status || old.ride_id != new.ride_id => {
            info!(
                ride = %new.ride_id,
                status = %new.status,
                awarded = ?new.awarded_points,
                "Ride changed"
            );
        }
        (Some(old), None) => {
            info!(ride = %old.ride_id, "Ride cleared");
        }
        _ => {}
    }

    if previous.connectivity.session.state != current.connectivity.session.state
        || previous.connectivity.topic.state != current.connectivity.topic.state
    {
        info!(
            session = %current.connectivity.session.state,
            topic = %current.connectivity.topic.state,
            "Connectivity changed"
        );
    }

    if current.last_error != previous.last_error {
        if let Some(error) = &current.last_error {
            warn!(error = %error, "Engine reported a problem");
        }
    }

    match (&previous.worker, &current.worker) {
        (Some(old), Some(new)) if old.points_balance != new.points_balance => {
            info!(balance = new.points_balance, "Points balance updated");
        }
        (None, Some(new)) => {
            info!(worker = %new.id, online = new.online, "Worker profile received");
        }
        _ => {}
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
