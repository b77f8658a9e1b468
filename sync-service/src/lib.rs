//! Headless huddle sync client.
//!
//! Activates one tenant, keeps every synchronized domain reconciled with the
//! backend through the push channel and a poll loop, and tears everything down
//! on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use huddle_backend_client::Backend;
use huddle_backend_client::HttpRemoteStore;
use huddle_backend_client::SsePushChannel;
use huddle_sync_core::SyncEngine;
use huddle_sync_core::cache::DurableCache;
use huddle_sync_core::cache::MemoryCache;
use huddle_sync_core::cache::open_or_fallback;
use huddle_sync_core::config::CacheConfig;
use huddle_sync_core::config::ConfigLoader;
use huddle_sync_core::config::SyncConfig;
use huddle_sync_core::model::Session;
use huddle_sync_core::model::TenantRole;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Keep a huddle's inbox, scopes, timeline and task order in sync.
#[derive(Debug, Parser)]
#[command(name = "huddle-sync", version)]
pub struct Cli {
    /// Config file (TOML). Defaults to ./huddle-sync.toml or the user config dir.
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Authenticated user id.
    #[arg(long, value_name = "USER_ID")]
    pub user: String,

    /// Huddle to activate. Without one nothing is synced.
    #[arg(long, value_name = "TENANT_ID")]
    pub tenant: Option<String>,

    /// The user administers the huddle (may seed scope windows).
    #[arg(long)]
    pub admin: bool,

    /// Run one activation and exit instead of polling.
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    pub fn session(&self) -> Session {
        let role = if self.admin {
            TenantRole::Admin
        } else {
            TenantRole::Member
        };
        match &self.tenant {
            Some(tenant) => Session::new(self.user.as_str(), tenant.as_str()).with_role(role),
            None => Session {
                user_id: self.user.as_str().into(),
                tenant_id: None,
                role,
                memberships: Vec::new(),
            },
        }
    }

    pub fn load_config(&self) -> anyhow::Result<SyncConfig> {
        let config = match &self.config {
            Some(path) => ConfigLoader::new().with_file(path).load(),
            None => ConfigLoader::load_default(),
        };
        config.context("failed to load configuration")
    }
}

pub fn open_cache(config: &CacheConfig) -> Arc<dyn DurableCache> {
    if config.in_memory {
        return Arc::new(MemoryCache::new());
    }
    if let Some(parent) = config.path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!("Cannot create cache directory {}: {e}", parent.display());
    }
    open_or_fallback(&config.path)
}

/// Wire the engine against the configured backend.
pub fn build_engine(config: &SyncConfig) -> anyhow::Result<(SyncEngine, Arc<SsePushChannel>)> {
    let backend = Backend::new(&config.remote).context("invalid remote configuration")?;
    let remote = Arc::new(HttpRemoteStore::new(backend.clone()));
    let channel = Arc::new(SsePushChannel::new(backend));
    let engine = SyncEngine::new(
        remote,
        open_cache(&config.cache),
        Arc::clone(&channel) as Arc<dyn huddle_sync_core::bridge::PushChannel>,
        config.client_id(),
    );
    Ok((engine, channel))
}

/// Activate the session's tenant and poll until `shutdown` flips to `true`.
pub async fn run(cli: &Cli, config: &SyncConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (engine, channel) = build_engine(config)?;
    let session = cli.session();

    let Some(report) = engine
        .activate(&session, chrono::Local::now().date_naive())
        .await
    else {
        tracing::warn!("No huddle selected; nothing to sync");
        return Ok(());
    };
    tracing::info!(
        "Tenant {} active: {:?}, weekly scope {}",
        report.tenant_id,
        report.sync,
        report
            .weekly_scope
            .as_ref()
            .map_or("unavailable", |scope| scope.name.as_str())
    );

    if !cli.once {
        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; activation already synced.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = engine.poll(&session).await;
                    tracing::debug!("Poll finished: {report:?}");
                    engine
                        .lifecycle()
                        .ensure_weekly_scope(&session, chrono::Local::now().date_naive())
                        .await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    engine.deactivate().await;
    channel.close();
    Ok(())
}
