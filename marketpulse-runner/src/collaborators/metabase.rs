//! Metabase refresh: tell the dashboard tool the warehouse changed.
//!
//! Sequence: authenticate, list databases, find the warehouse connection by
//! engine, then trigger schema sync, field recompute and cached-value rescan.
//! Every call must answer 200 or 202; anything else fails the phase.

use super::{CollaboratorError, Refresher};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const SESSION_HEADER: &str = "X-Metabase-Session";
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub enum MetabaseAuth {
    /// Username/password exchanged for a session token.
    Session { username: String, password: String },
    /// Long-lived API key.
    ApiKey(String),
}

impl std::fmt::Debug for MetabaseAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetabaseAuth::Session { username, .. } => f
                .debug_struct("Session")
                .field("username", username)
                .finish_non_exhaustive(),
            MetabaseAuth::ApiKey(_) => f.write_str("ApiKey(..)"),
        }
    }
}

/// A database registered in Metabase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRef {
    pub id: i64,
    pub name: String,
    pub engine: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

/// Find the first database using `engine` in a `GET /api/database` body.
///
/// Newer servers wrap the list in `{"data": [...]}`, older ones return the bare array.
pub fn pick_database(body: &Value, engine: &str) -> Result<DatabaseRef, CollaboratorError> {
    let list = body
        .get("data")
        .unwrap_or(body)
        .as_array()
        .ok_or_else(|| CollaboratorError::UnexpectedResponse {
            step: "list databases".into(),
            message: format!("expected a database list, got {body}"),
        })?;

    let db = list
        .iter()
        .find(|db| {
            db.get("engine")
                .and_then(Value::as_str)
                .is_some_and(|e| e.eq_ignore_ascii_case(engine))
        })
        .ok_or_else(|| CollaboratorError::DatabaseNotFound {
            engine: engine.to_string(),
        })?;

    let id = db
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| CollaboratorError::UnexpectedResponse {
            step: "list databases".into(),
            message: format!("database entry without numeric id: {db}"),
        })?;

    Ok(DatabaseRef {
        id,
        name: db
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        engine: engine.to_string(),
    })
}

fn accepted(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::ACCEPTED
}

pub struct MetabaseRefresher {
    client: Client,
    base_url: String,
    auth: MetabaseAuth,
    engine: String,
}

impl MetabaseRefresher {
    pub fn new(
        base_url: &str,
        auth: MetabaseAuth,
        engine: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Request {
                step: "client setup".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            engine: engine.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a request and require 200/202. Returns the body text.
    fn send(&self, step: &str, req: RequestBuilder) -> Result<String, CollaboratorError> {
        let resp = req.send().map_err(|e| CollaboratorError::Request {
            step: step.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !accepted(status) {
            return Err(CollaboratorError::Status {
                step: step.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        debug!(step, status = status.as_u16(), "metabase call accepted");
        Ok(body)
    }

    /// Header carrying the credentials for every call after login.
    fn auth_header(&self) -> Result<(&'static str, String), CollaboratorError> {
        match &self.auth {
            MetabaseAuth::ApiKey(key) => Ok((API_KEY_HEADER, key.clone())),
            MetabaseAuth::Session { username, password } => {
                let body = self.send(
                    "login",
                    self.client
                        .post(self.url("/api/session"))
                        .json(&serde_json::json!({ "username": username, "password": password })),
                )?;
                let session: SessionResponse =
                    serde_json::from_str(&body).map_err(|e| CollaboratorError::UnexpectedResponse {
                        step: "login".into(),
                        message: e.to_string(),
                    })?;
                info!("authenticated with metabase");
                Ok((SESSION_HEADER, session.id))
            }
        }
    }
}

impl Refresher for MetabaseRefresher {
    fn name(&self) -> &str {
        "metabase"
    }

    fn run(&self) -> Result<(), CollaboratorError> {
        let (header, token) = self.auth_header()?;

        let body = self.send(
            "list databases",
            self.client
                .get(self.url("/api/database"))
                .header(header, &token),
        )?;
        let dbs: Value =
            serde_json::from_str(&body).map_err(|e| CollaboratorError::UnexpectedResponse {
                step: "list databases".into(),
                message: e.to_string(),
            })?;
        let db = pick_database(&dbs, &self.engine)?;
        info!(db_id = db.id, name = %db.name, engine = %db.engine, "found warehouse database");

        for (step, action) in [
            ("schema sync", "sync_schema"),
            ("field recompute", "recompute"),
            ("cached value refresh", "rescan_values"),
        ] {
            self.send(
                step,
                self.client
                    .post(self.url(&format!("/api/database/{}/{action}", db.id)))
                    .header(header, &token),
            )?;
            info!(db_id = db.id, "{step} triggered");
        }

        info!("metabase refresh completed");
        Ok(())
    }
}
