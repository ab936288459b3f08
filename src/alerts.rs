//! Operator alerting.
//!
//! Alerts are a post-processing side effect: they fire after the triggering
//! record is persisted, from a spawned task, and their failure is logged
//! and swallowed. A dead bot token must never fail a reconciliation run.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Sends alerts to the operators' Telegram chat via the Bot API.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: i64,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            bot_token: bot_token.to_string(),
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .context("send alert")?;
        anyhow::ensure!(
            response.status().is_success(),
            "telegram responded {}",
            response.status()
        );
        Ok(())
    }
}

/// Used when no alert channel is configured, and in tests.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        info!(text, "alert (no channel configured)");
        Ok(())
    }
}

/// Fire-and-forget dispatch. The spawned task owns the notifier; the
/// caller returns immediately.
pub fn dispatch(notifier: Arc<dyn Notifier>, text: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&text).await {
            warn!(error = %e, "alert dispatch failed");
        }
    });
}
