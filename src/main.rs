// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use crm_sync::server::{app_router, AppState};
use crm_sync::storage::redis::RedisCache;
use crm_sync::storage::sql::SqlStore;
use crm_sync::storage::InMemoryCache;
use crm_sync::{
    CacheBackend, CredentialProvider, Credentials, KeapClient, OAuthRefresher, StaticCredentials, Stores,
    SyncAccount, SyncConfig, SyncOrchestrator,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production injects the environment.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("crm_sync=info,tower_http=info")),
        )
        .init();

    let config = SyncConfig::from_env()?;
    tracing::info!(?config, "Starting crm-sync");

    let stores = connect_stores(&config).await?;
    let api = Arc::new(KeapClient::new(&config.source_base_url, config.request_timeout())?);
    let credentials = credential_provider(&config)?;

    let orchestrator = Arc::new(SyncOrchestrator::new(config.clone(), stores, api, credentials));
    bootstrap_account(&orchestrator).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = (config.schedule_interval_secs > 0).then(|| {
        orchestrator.spawn_scheduler(Duration::from_secs(config.schedule_interval_secs), shutdown_rx)
    });

    let router = app_router(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "crm-sync listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        handle.await?;
    }
    tracing::info!("crm-sync stopped");
    Ok(())
}

/// SQL and Redis when configured, in-memory otherwise.
async fn connect_stores(config: &SyncConfig) -> Result<Stores, Box<dyn std::error::Error>> {
    let cache: Arc<dyn CacheBackend> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::with_prefix(url, Some("crm:")).await?),
        None => {
            tracing::warn!("CRM_SYNC_REDIS_URL not set, caching in process memory");
            Arc::new(InMemoryCache::new())
        }
    };

    match &config.sql_url {
        Some(url) => Ok(Stores::sql(Arc::new(SqlStore::new(url).await?), cache)),
        None => {
            tracing::warn!("CRM_SYNC_SQL_URL not set, mirroring into process memory");
            Ok(Stores { cache, ..Stores::in_memory() })
        }
    }
}

fn credential_provider(config: &SyncConfig) -> Result<Arc<dyn CredentialProvider>, Box<dyn std::error::Error>> {
    match (&config.client_id, &config.client_secret) {
        (Some(id), Some(secret)) => {
            let client = reqwest::Client::builder().timeout(config.request_timeout()).build()?;
            Ok(Arc::new(OAuthRefresher::new(client, &config.token_url, id, secret)))
        }
        _ => {
            tracing::warn!("OAuth client credentials not set, tokens will not be refreshed");
            Ok(Arc::new(StaticCredentials))
        }
    }
}

/// Register the account named by `CRM_SYNC_ACCOUNT_ID` unless it already
/// exists, so stored (possibly refreshed) credentials are never replaced.
async fn bootstrap_account(orchestrator: &SyncOrchestrator) -> Result<(), Box<dyn std::error::Error>> {
    let Ok(id) = std::env::var("CRM_SYNC_ACCOUNT_ID") else {
        return Ok(());
    };
    if orchestrator.account(&id).await.is_ok() {
        return Ok(());
    }
    let credentials = Credentials {
        access_token: std::env::var("CRM_SYNC_ACCESS_TOKEN").unwrap_or_default(),
        refresh_token: std::env::var("CRM_SYNC_REFRESH_TOKEN").ok(),
        expires_at: None,
    };
    orchestrator.register_account(SyncAccount::new(id, credentials)).await?;
    Ok(())
}
