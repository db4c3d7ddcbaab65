//! Terminal credentials and session access.
//!
//! Credentials live in the OS credential store (Windows DPAPI, macOS
//! Keychain, Linux Secret Service via the `keyring` crate). The sync engine
//! never reads the keyring directly; it goes through the [`SessionProvider`]
//! trait so tests can inject a fixed session or none at all.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::api;
use crate::error::{SyncError, SyncResult};

const SERVICE_NAME: &str = "tillsync";

// Credential keys
const KEY_ADMIN_URL: &str = "admin_dashboard_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_BRANCH_ID: &str = "branch_id";
const KEY_ORG_ID: &str = "organization_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[
    KEY_ADMIN_URL,
    KEY_TERMINAL_ID,
    KEY_API_KEY,
    KEY_BRANCH_ID,
    KEY_ORG_ID,
];

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// An authenticated terminal session against the admin dashboard.
///
/// No `Debug` derive: the API key must not end up in log output.
#[derive(Clone)]
pub struct Session {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub branch_id: Option<String>,
}

/// Source of the current session, injected into the engine.
///
/// Returning `None` means "no authenticated session": drains abort without
/// consuming any retry counters.
pub trait SessionProvider: Send + Sync {
    fn session(&self) -> Option<Session>;
}

/// A fixed session is its own provider (handy for tests and tooling).
impl SessionProvider for Session {
    fn session(&self) -> Option<Session> {
        Some(self.clone())
    }
}

/// Production provider backed by the OS credential store.
pub struct KeyringSessionProvider;

impl SessionProvider for KeyringSessionProvider {
    fn session(&self) -> Option<Session> {
        let admin_url = get_credential(KEY_ADMIN_URL)?;
        let api_key = get_credential(KEY_API_KEY)?;
        let terminal_id = get_credential(KEY_TERMINAL_ID)?;
        Some(Session {
            admin_url,
            api_key,
            terminal_id,
            branch_id: get_credential(KEY_BRANCH_ID),
        })
    }
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> SyncResult<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credentials(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| SyncError::Credentials(e.to_string()))?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> SyncResult<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Credentials(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Credentials(e.to_string())),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

/// The terminal is considered configured when admin URL, terminal ID, and API
/// key are all present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_ADMIN_URL) && has_credential(KEY_TERMINAL_ID) && has_credential(KEY_API_KEY)
}

// ---------------------------------------------------------------------------
// Onboarding
// ---------------------------------------------------------------------------

/// Store terminal credentials received during onboarding.
///
/// Expected JSON shape (camelCase, matching the onboarding payload):
/// ```json
/// {
///   "terminalId": "...",
///   "apiKey": "...",
///   "adminUrl": "...",      // optional when encoded in the key
///   "branchId": "...",      // optional
///   "organizationId": "..." // optional
/// }
/// ```
/// The `apiKey` may be a plain key or a connection string (base64 JSON with
/// url/key/terminal id); connection strings take precedence for any field
/// they carry.
pub fn update_terminal_credentials(payload: &Value) -> SyncResult<()> {
    let raw_api_key = payload
        .get("apiKey")
        .or_else(|| payload.get("pos_api_key"))
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::InvalidInput("Missing required field: apiKey".into()))?;
    let mut terminal_id = payload
        .get("terminalId")
        .or_else(|| payload.get("terminal_id"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut admin_url = payload
        .get("adminUrl")
        .or_else(|| payload.get("admin_dashboard_url"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut api_key = raw_api_key.trim().to_string();
    if let Some(decoded_key) = api::extract_api_key_from_connection_string(raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_tid) = api::extract_terminal_id_from_connection_string(raw_api_key) {
            terminal_id = Some(decoded_tid);
        }
        if let Some(decoded_url) = api::extract_admin_url_from_connection_string(raw_api_key) {
            admin_url = Some(decoded_url);
        }
    }

    let terminal_id = terminal_id
        .ok_or_else(|| SyncError::InvalidInput("Missing required field: terminalId".into()))?;
    if api_key.trim().is_empty() {
        return Err(SyncError::InvalidInput(
            "Missing required field: apiKey".into(),
        ));
    }

    set_credential(KEY_TERMINAL_ID, &terminal_id)?;
    set_credential(KEY_API_KEY, api_key.trim())?;

    if let Some(url) = admin_url.as_deref() {
        let normalized = api::normalize_admin_url(url);
        if !normalized.trim().is_empty() {
            set_credential(KEY_ADMIN_URL, normalized.trim())?;
        }
    }
    if let Some(bid) = payload
        .get("branchId")
        .or_else(|| payload.get("branch_id"))
        .and_then(Value::as_str)
    {
        set_credential(KEY_BRANCH_ID, bid)?;
    }
    if let Some(oid) = payload
        .get("organizationId")
        .or_else(|| payload.get("organization_id"))
        .and_then(Value::as_str)
    {
        set_credential(KEY_ORG_ID, oid)?;
    }

    info!(terminal_id = %terminal_id, "terminal credentials updated");
    Ok(())
}

/// Delete every stored credential (factory reset / logout).
pub fn factory_reset() -> SyncResult<()> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
