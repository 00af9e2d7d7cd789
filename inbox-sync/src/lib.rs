//! Inbox Sync - real-time conversation sync for a shared team inbox
//!
//! Keeps an in-memory model of a tenant's conversations consistent with the
//! server while push events, catch-up listings and optimistic local edits
//! arrive in any order.
//!
//! ## Module Organization
//!
//! - `types/`: Data structures and the crate error
//! - `config/`: TOML configuration and reconnect policy
//! - `services/`: Address and recipient helpers (stateless)
//! - `sync/`: Connection, codec, dispatcher, reconciler, store, views
//! - `adapters/`: REST collaborator
//! - `state/`: Session owning one tenant/user context

pub mod adapters;
pub mod config;
pub mod services;
pub mod state;
pub mod sync;
pub mod types;

use tracing::info;
use tracing_subscriber::EnvFilter;

use adapters::api::HttpInboxApi;
use config::AppConfig;
use state::InboxSession;
use sync::selectors;
use types::error::Result;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            // Debug build: show debug logs for our crate, info for others
            EnvFilter::new("inbox_sync_lib=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Run a headless session until Ctrl-C, logging view sizes on every change
pub async fn run(config: AppConfig) -> Result<()> {
    info!("Starting inbox sync ...");

    let api = HttpInboxApi::from_config(&config)?;
    let session = InboxSession::from_config(&config, api)?;
    session.start().await?;

    let identity = session.identity().await;
    let mut changes = session.reconciler().changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let counts = session
                    .reconciler()
                    .read(|store| selectors::counts(store, &identity));
                let summary = counts
                    .iter()
                    .map(|(view, n)| format!("{}={}", view, n))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("Inbox updated: {}", summary);
            }
        }
    }

    session.shutdown();
    Ok(())
}
