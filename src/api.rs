//! Admin dashboard API client.
//!
//! Defines [`RemoteBackend`], the engine's view of the remote system of
//! record (sale submission, e-invoice create/cancel, catalog fetch, health
//! probe), and [`AdminApi`], the authenticated reqwest implementation used in
//! production. Queue drains and the orchestrator only ever see the trait, so
//! tests run against scripted stubs.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::cache::{CachedCategory, CachedProduct};
use crate::error::{SyncError, SyncResult};
use crate::invoices::BuyerInfo;
use crate::sales::PendingSale;
use crate::storage::{Session, SessionProvider};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Remote backend contract
// ---------------------------------------------------------------------------

/// Identifier and reference number assigned by the remote system to a sale.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteSaleReceipt {
    pub remote_id: String,
    pub reference: Option<String>,
}

/// Issued e-invoice number returned by the remote system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InvoiceIssued {
    pub invoice_number: String,
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The remote system of record, as seen by the sync engine.
///
/// At-least-once semantics: implementations must tolerate a replayed call for
/// work they already accepted (the engine marks local state only after a
/// success response, so a crash in between produces a duplicate submission).
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Submit an offline-recorded sale; returns the remote id and the issued
    /// reference number.
    async fn submit_sale(&self, sale: &PendingSale) -> SyncResult<RemoteSaleReceipt>;

    /// Create an e-invoice for a sale that already exists remotely.
    async fn create_invoice(&self, sale_id: &str, buyer: &BuyerInfo) -> SyncResult<InvoiceIssued>;

    /// Cancel a previously issued e-invoice.
    async fn cancel_invoice(&self, invoice_id: &str, reason: &str) -> SyncResult<()>;

    /// Fetch the full set of active products.
    async fn fetch_products(&self) -> SyncResult<Vec<CachedProduct>>;

    /// Fetch the full set of active categories.
    async fn fetch_categories(&self) -> SyncResult<Vec<CachedCategory>>;

    /// Lightweight health probe.
    async fn health_check(&self) -> ConnectivityResult;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_admin_url)
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("tid")
                .or_else(|| v.get("terminalId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach admin dashboard at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid admin dashboard URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => format!("Admin dashboard server error (HTTP {s})"),
        s => format!("Unexpected response from admin dashboard (HTTP {s})"),
    }
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Accept either a bare JSON array or an object wrapping one under `key`.
fn unwrap_list(value: Value, key: &str) -> SyncResult<Value> {
    match value {
        Value::Array(_) => Ok(value),
        Value::Object(mut map) => map
            .remove(key)
            .filter(Value::is_array)
            .ok_or_else(|| SyncError::Remote(format!("Missing '{key}' list in response"))),
        _ => Err(SyncError::Remote(format!(
            "Unexpected response shape for '{key}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Production client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for the admin dashboard.
///
/// Credentials are resolved per request from the injected [`SessionProvider`]
/// so a re-onboarded terminal picks up new keys without a restart.
pub struct AdminApi {
    session: Arc<dyn SessionProvider>,
    client: Client,
}

impl AdminApi {
    pub fn new(session: Arc<dyn SessionProvider>) -> SyncResult<AdminApi> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(AdminApi { session, client })
    }

    fn current_session(&self) -> SyncResult<Session> {
        self.session.session().ok_or(SyncError::NotConfigured)
    }

    /// Perform an authenticated request against the admin dashboard.
    ///
    /// `path` includes the leading slash, e.g. `/api/pos/sales`.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> SyncResult<Value> {
        let session = self.current_session()?;
        let base = normalize_admin_url(&session.admin_url);
        let resolved_api_key = extract_api_key_from_connection_string(&session.api_key)
            .unwrap_or_else(|| session.api_key.clone());
        let full_url = format!("{base}{path}");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", resolved_api_key)
            .header("x-terminal-id", &session.terminal_id)
            .header("Content-Type", "application/json");

        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::Network(friendly_error(&base, &e)))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve validation details for sync queue visibility.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                let message = json
                    .get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status));
                let details = json.get("details").or_else(|| json.get("errors")).cloned();
                if let Some(details) = details {
                    format!("{message} (HTTP {}): {}", status.as_u16(), details)
                } else {
                    format!("{message} (HTTP {})", status.as_u16())
                }
            } else if !body_text.trim().is_empty() {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(SyncError::Remote(detail));
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| SyncError::Remote(format!("Invalid JSON from admin dashboard: {e}")))
    }
}

#[async_trait]
impl RemoteBackend for AdminApi {
    async fn submit_sale(&self, sale: &PendingSale) -> SyncResult<RemoteSaleReceipt> {
        let body = serde_json::json!({
            "local_id": sale.id,
            "local_reference": sale.local_reference,
            "items": sale.items,
            "customer": sale.customer,
            "payments": sale.payments,
            "subtotal": sale.subtotal,
            "vat_total": sale.vat_total,
            "discount_total": sale.discount_total,
            "total": sale.total,
            "note": sale.note,
            "created_at": sale.created_at,
        });
        let resp = self
            .request(Method::POST, "/api/pos/sales", Some(body))
            .await?;

        let remote_id = str_any(&resp, &["id", "sale_id", "saleId"])
            .ok_or_else(|| SyncError::Remote("Missing sale id in response".into()))?;
        let reference = str_any(&resp, &["reference", "invoice_number", "invoiceNumber"]);
        Ok(RemoteSaleReceipt {
            remote_id,
            reference,
        })
    }

    async fn create_invoice(&self, sale_id: &str, buyer: &BuyerInfo) -> SyncResult<InvoiceIssued> {
        let body = serde_json::json!({
            "sale_id": sale_id,
            "buyer": buyer,
        });
        let resp = self
            .request(Method::POST, "/api/pos/invoices", Some(body))
            .await?;
        let invoice_number = str_any(&resp, &["invoice_number", "invoiceNumber", "number"])
            .ok_or_else(|| SyncError::Remote("Missing invoice number in response".into()))?;
        Ok(InvoiceIssued { invoice_number })
    }

    async fn cancel_invoice(&self, invoice_id: &str, reason: &str) -> SyncResult<()> {
        let path = format!("/api/pos/invoices/{invoice_id}/cancel");
        let body = serde_json::json!({ "reason": reason });
        self.request(Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn fetch_products(&self) -> SyncResult<Vec<CachedProduct>> {
        let resp = self
            .request(Method::GET, "/api/pos/catalog/products", None)
            .await?;
        let list = unwrap_list(resp, "products")?;
        let products: Vec<CachedProduct> = serde_json::from_value(list)?;
        Ok(products)
    }

    async fn fetch_categories(&self) -> SyncResult<Vec<CachedCategory>> {
        let resp = self
            .request(Method::GET, "/api/pos/catalog/categories", None)
            .await?;
        let list = unwrap_list(resp, "categories")?;
        let categories: Vec<CachedCategory> = serde_json::from_value(list)?;
        Ok(categories)
    }

    /// Probe `{admin_url}/api/health` with a short timeout. Never errors; the
    /// outcome is carried in the result so callers can feed the connectivity
    /// monitor directly.
    async fn health_check(&self) -> ConnectivityResult {
        let session = match self.current_session() {
            Ok(s) => s,
            Err(_) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some("Terminal is not configured".into()),
                };
            }
        };
        let url = normalize_admin_url(&session.admin_url);
        let resolved_api_key = extract_api_key_from_connection_string(&session.api_key)
            .unwrap_or_else(|| session.api_key.clone());
        let health_url = format!("{url}/api/health");

        let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(format!("Failed to create HTTP client: {e}")),
                };
            }
        };

        let start = Instant::now();

        let resp = match client
            .get(&health_url)
            .header("X-POS-API-Key", resolved_api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(friendly_error(&url, &e)),
                };
            }
        };

        let latency = start.elapsed().as_millis() as u64;
        let status = resp.status();

        if status.is_success() {
            info!(latency_ms = latency, "connectivity probe passed");
            ConnectivityResult {
                success: true,
                latency_ms: Some(latency),
                error: None,
            }
        } else {
            ConnectivityResult {
                success: false,
                latency_ms: Some(latency),
                error: Some(status_error(status)),
            }
        }
    }
}
