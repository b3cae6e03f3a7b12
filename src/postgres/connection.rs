// ABOUTME: PostgreSQL connection setup with TLS and a per-session statement timeout
// ABOUTME: Spawns the connection driver task and masks credentials in errors

use anyhow::{Context, Result};
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::sanitize_url;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Decide once per process whether TLS connections accept invalid
/// certificates. Later calls are ignored.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Open a connection and spawn its driver task. The connection closes when
/// the returned client is dropped.
pub async fn connect(url: &str) -> Result<Client> {
    let mut builder = native_tls::TlsConnector::builder();
    if allow_self_signed() {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    let tls = postgres_native_tls::MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    Ok(client)
}

/// Open a connection whose statements are cancelled by the server after
/// `statement_timeout`.
pub async fn connect_with_timeout(url: &str, statement_timeout: Duration) -> Result<Client> {
    let client = connect(url).await?;
    client
        .batch_execute(&format!(
            "SET statement_timeout = {}",
            statement_timeout.as_millis()
        ))
        .await
        .context("Failed to set statement_timeout")?;
    Ok(client)
}
