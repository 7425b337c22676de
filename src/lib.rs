pub mod database;
pub mod error;
pub mod events;
pub mod service;
pub mod settings;
pub mod state;
pub mod store;
pub mod tunnel;

use crate::events::{RuleEvent, StatusSummary};
use crate::state::AppState;
use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

pub use crate::database::models::{ForwardSpec, ReverseSpec, Rule, RuleSpec, RuleStatus};
pub use crate::error::{TunnelError, TunnelResult};
pub use crate::service::TunnelService;

/// Runs the headless daemon: replays rules that were running, logs rule
/// events until Ctrl-C, then tears everything down.
pub async fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_data_dir = settings::app_data_dir()?;
    info!("Using data directory {}", app_data_dir.display());

    let state = AppState::init(&app_data_dir).await?;
    let settings = state.settings.get_settings();

    let mut events = state.events.subscribe();
    let monitor = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RuleEvent::ListChanged { rules }) => {
                    info!("Rules: {}", StatusSummary::from_rules(&rules));
                }
                Ok(RuleEvent::ConnectionFailed { id, error }) => {
                    debug!("Connection on {} failed: {}", id, error);
                }
                Ok(RuleEvent::StatusChanged { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event monitor skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let service = state.tunnel_service.clone();
    if settings.replay_on_startup {
        let started = service.replay().await;
        info!("Replay started {} rules", started.len());
    } else {
        info!("Startup replay disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    service.shutdown(settings.shutdown_grace()).await;
    monitor.abort();
    state.db.close().await?;

    info!("Bye");
    Ok(())
}
