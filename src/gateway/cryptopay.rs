//! Crypto Pay API client.
//!
//! Thin HTTP client over the gateway's REST surface: getBalance,
//! transfer, createInvoice. Amounts cross the wire as decimal strings and
//! are converted to fixed-point at this boundary. Transfers carry the
//! caller's idempotency key (spend_id) so a retried request can never pay
//! twice.

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::gateway::{GatewayBalance, GatewayError, InvoiceHandle, PaymentGateway, TransferReceipt};
use crate::ledger::amount::{format_amount, parse_amount, Amount};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 250;

pub struct CryptoPayClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct BalanceEntry {
    currency_code: String,
    available: String,
    #[serde(default)]
    onhold: String,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    transfer_id: i64,
    amount: String,
    #[serde(default)]
    fee: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceResult {
    invoice_id: i64,
    pay_url: String,
}

impl CryptoPayClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("Rollhouse/1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// POST with retry on transport errors and 5xx. 4xx responses are
    /// decoded into named errors and never retried; a rejected transfer
    /// stays rejected.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, GatewayError> {
        let url = format!("{}/api/{}", self.base_url, method);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_err = String::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }

            let response = self
                .client
                .post(&url)
                .header("Crypto-Pay-API-Token", &self.token)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(method, attempt, error = %e, "gateway request failed");
                    last_err = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(method, attempt, "gateway rate limited");
                last_err = "rate limited".to_string();
                continue;
            }
            if status.is_server_error() {
                warn!(method, attempt, %status, "gateway server error");
                last_err = format!("status {}", status);
                continue;
            }

            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|e| GatewayError::Unavailable(format!("bad response: {}", e)))?;

            if envelope.ok {
                return envelope
                    .result
                    .ok_or_else(|| GatewayError::Unavailable("empty result".to_string()));
            }
            let err = envelope.error.unwrap_or(ApiError {
                code: 0,
                name: "UNKNOWN".to_string(),
            });
            debug!(method, code = err.code, name = %err.name, "gateway rejected call");
            return Err(map_api_error(&err));
        }

        // Rate-limit exhaustion is its own variant so callers can back off
        // instead of compensating.
        if last_err == "rate limited" {
            return Err(GatewayError::RateLimited);
        }
        Err(GatewayError::Unavailable(last_err))
    }
}

fn map_api_error(err: &ApiError) -> GatewayError {
    match err.name.as_str() {
        "NOT_ENOUGH_COINS" | "INSUFFICIENT_FUNDS" => GatewayError::InsufficientFunds,
        "USER_NOT_FOUND" | "CHAT_NOT_FOUND" => GatewayError::UnknownRecipient,
        "SPEND_ID_ALREADY_EXISTS" | "TRANSFER_ALREADY_EXISTS" => {
            GatewayError::DuplicateIdempotencyKey
        }
        "TOO_MANY_REQUESTS" => GatewayError::RateLimited,
        name => GatewayError::Rejected(format!("{} ({})", name, err.code)),
    }
}

fn parse_wire_amount(s: &str) -> Result<Amount, GatewayError> {
    parse_amount(s).ok_or_else(|| GatewayError::Unavailable(format!("bad amount: {}", s)))
}

#[async_trait::async_trait]
impl PaymentGateway for CryptoPayClient {
    async fn get_balance(&self, asset: &str) -> Result<GatewayBalance, GatewayError> {
        let entries: Vec<BalanceEntry> = self.call("getBalance", json!({})).await?;

        let entry = entries
            .iter()
            .find(|e| e.currency_code.eq_ignore_ascii_case(asset))
            .ok_or_else(|| GatewayError::Rejected(format!("no balance for {}", asset)))?;

        let available = parse_wire_amount(&entry.available)?;
        let onhold = if entry.onhold.is_empty() {
            0
        } else {
            parse_wire_amount(&entry.onhold)?
        };
        Ok(GatewayBalance {
            available,
            onhold,
            total: available + onhold,
        })
    }

    async fn transfer(
        &self,
        recipient_id: i64,
        asset: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<TransferReceipt, GatewayError> {
        let result: TransferResult = self
            .call(
                "transfer",
                json!({
                    "user_id": recipient_id,
                    "asset": asset,
                    "amount": format_amount(amount),
                    "spend_id": idempotency_key,
                }),
            )
            .await?;

        let fee = match result.fee.as_deref() {
            Some(fee) => parse_wire_amount(fee)?,
            None => 0,
        };
        Ok(TransferReceipt {
            transfer_id: result.transfer_id.to_string(),
            amount: parse_wire_amount(&result.amount)?,
            fee,
        })
    }

    async fn create_invoice(
        &self,
        asset: &str,
        amount: Amount,
        description: &str,
    ) -> Result<InvoiceHandle, GatewayError> {
        let result: InvoiceResult = self
            .call(
                "createInvoice",
                json!({
                    "asset": asset,
                    "amount": format_amount(amount),
                    "description": description,
                }),
            )
            .await?;

        Ok(InvoiceHandle {
            invoice_id: result.invoice_id.to_string(),
            pay_url: result.pay_url,
        })
    }
}
