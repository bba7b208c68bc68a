//! Signer-liveness endpoint.
//!
//! `GET /checksigner?address=0x...&timeout=MINUTES` answers whether a
//! whitelisted signer has produced a block within the window. The store is
//! consumed read-only; the whitelist is a text file of `address,expiry_unix`
//! lines reloaded every five minutes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;

use cliquescan_sync::BlockStore;

use crate::adapters::PgBlockStore;

const WHITELIST_REFRESH: Duration = Duration::from_secs(300);
const DEFAULT_WINDOW_MINUTES: u64 = 45;

/// Whitelisted signers and their expiry timestamps.
#[derive(Clone)]
pub struct AllowedSigners {
    path: PathBuf,
    entries: Arc<RwLock<HashMap<String, u64>>>,
}

impl AllowedSigners {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Re-read the whitelist file. A missing or unreadable file keeps the
    /// previous entries.
    pub async fn reload(&self) {
        let entries = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => parse_allowed_signers(&data),
            Err(e) => {
                warn!(
                    "cannot read allowed signers file {}: {}",
                    self.path.display(),
                    e
                );
                return;
            }
        };
        info!("loaded {} allowed signers", entries.len());
        *self.entries.write().await = entries;
    }

    pub async fn expiry(&self, address: &str) -> Option<u64> {
        self.entries.read().await.get(address).copied()
    }
}

/// Lines are `address,expiry_unix`; anything else is ignored.
fn parse_allowed_signers(data: &str) -> HashMap<String, u64> {
    let mut entries = HashMap::new();
    for line in data.lines() {
        let mut parts = line.splitn(2, ',');
        let address = match parts.next() {
            Some(address) => address.trim().to_lowercase(),
            None => continue,
        };
        let expiry = match parts.next().and_then(|e| e.trim().parse::<u64>().ok()) {
            Some(expiry) => expiry,
            None => continue,
        };
        if !address.is_empty() {
            entries.insert(address, expiry);
        }
    }
    entries
}

struct AppState {
    store: PgBlockStore,
    allowed: AllowedSigners,
}

#[derive(Deserialize)]
struct CheckSignerQuery {
    address: Option<String>,
    /// Liveness window in minutes.
    timeout: Option<u64>,
}

#[get("/checksigner")]
async fn checksigner(
    query: web::Query<CheckSignerQuery>,
    state: web::Data<AppState>,
) -> impl Responder {
    let address = match query.address.as_deref() {
        Some(address) => address.to_lowercase(),
        None => {
            return HttpResponse::BadRequest().json(json!({ "error": "address is required" }));
        }
    };
    let window_secs = query.timeout.unwrap_or(DEFAULT_WINDOW_MINUTES) * 60;
    let now = unix_now();

    match state.allowed.expiry(&address).await {
        None => {
            return HttpResponse::NotFound().json(json!({
                "status": "error",
                "message": "signer address not whitelisted",
            }));
        }
        Some(expiry) if now > expiry => {
            // The whitelist may have rotated; pick up a fresh copy before
            // rejecting.
            state.allowed.reload().await;
            if state.allowed.expiry(&address).await.is_none() {
                return HttpResponse::NotFound().json(json!({
                    "status": "error",
                    "message": "signer address not whitelisted",
                }));
            }
        }
        Some(_) => {}
    }

    match state.store.last_signed_timestamp(&address).await {
        Ok(Some(last)) => {
            if now.saturating_sub(last) > window_secs {
                HttpResponse::BadRequest().json(json!({
                    "status": "error",
                    "message": format!(
                        "signer did not validate a block in the last {} minutes",
                        window_secs / 60
                    ),
                }))
            } else {
                HttpResponse::Ok().json(json!({
                    "status": "ok",
                    "last_validated_timestamp": last,
                }))
            }
        }
        Ok(None) => HttpResponse::NotFound().json(json!({
            "status": "error",
            "message": "signer address not found",
        })),
        Err(e) => {
            warn!("liveness lookup failed for {}: {}", address, e);
            HttpResponse::InternalServerError().json(json!({ "error": "store error" }))
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Serve the liveness endpoint, refreshing the whitelist periodically.
pub async fn serve(
    store: PgBlockStore,
    allowed: AllowedSigners,
    host: String,
    port: u16,
) -> anyhow::Result<()> {
    allowed.reload().await;
    {
        let allowed = allowed.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WHITELIST_REFRESH).await;
                allowed.reload().await;
            }
        });
    }

    let state = web::Data::new(AppState { store, allowed });
    info!("liveness endpoint listening on {}:{}", host, port);
    HttpServer::new(move || App::new().app_data(state.clone()).service(checksigner))
        .bind((host.as_str(), port))?
        .run()
        .await?;
    Ok(())
}
