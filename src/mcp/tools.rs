use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::providers::{
    ProviderError, ResourceDescriptor, ResourceProvider, ToolDescriptor, ToolProvider,
};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::user_store::UserStore;
use crate::auth::{CredentialError, RequestContext};
use crate::config::{AuthConfig, DatabaseConfig};
use crate::db::{AccessChecker, ConnectionManager, SavedConnectionRegistry};
use crate::error::AppError;

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ProviderError> {
    serde_json::from_value(args).map_err(|e| ProviderError::InvalidParams(e.to_string()))
}

// ── login ──

#[derive(Deserialize)]
struct LoginArgs {
    username: String,
    password: String,
}

/// Authenticates a username/password and mints a session token. The one
/// tool the middleware lets through unauthenticated.
pub struct LoginTool {
    users: Arc<UserStore>,
    limiter: Arc<RateLimiter>,
    manager: Arc<ConnectionManager>,
    session_ttl_secs: u64,
    max_failed_attempts: u32,
}

impl LoginTool {
    pub fn new(
        users: Arc<UserStore>,
        limiter: Arc<RateLimiter>,
        manager: Arc<ConnectionManager>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            users,
            limiter,
            manager,
            session_ttl_secs: config.session_ttl_secs,
            max_failed_attempts: config.max_failed_attempts,
        }
    }
}

#[async_trait]
impl ToolProvider for LoginTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "login".to_string(),
            description: "Authenticate with username and password to obtain a session token"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "username": {"type": "string"},
                    "password": {"type": "string"}
                },
                "required": ["username", "password"]
            }),
        }
    }

    async fn call(&self, ctx: &RequestContext, args: Value) -> Result<Value, ProviderError> {
        let args: LoginArgs = parse_args(args)?;
        let ip = ctx.ip_address().parse().ok();

        match self.users.authenticate(
            &args.username,
            &args.password,
            self.max_failed_attempts,
            Duration::seconds(self.session_ttl_secs as i64),
        ) {
            Ok(grant) => {
                // A user has at most one session; a re-login revoked the
                // previous one, so its pools close now rather than at the
                // idle sweep.
                if let Some(hash) = &grant.replaced_session_hash {
                    self.manager.purge_by_hash(hash).await;
                }
                tracing::info!(username = %args.username, "user logged in");
                Ok(json!({
                    "username": args.username,
                    "session_token": grant.token,
                    "expires_at": grant.expires_at.to_rfc3339(),
                }))
            }
            Err(e) => {
                tracing::warn!(username = %args.username, reason = %e, "login failed");
                if matches!(e, CredentialError::InvalidCredentials) {
                    if let Some(ip) = ip {
                        self.limiter.record_failure(ip);
                    }
                }
                // CredentialError display strings are the fixed,
                // non-enumerating client messages.
                Err(ProviderError::Failed(e.to_string()))
            }
        }
    }
}

// ── logout ──

/// Ends the caller's session and closes its connection pools.
pub struct LogoutTool {
    users: Arc<UserStore>,
    manager: Arc<ConnectionManager>,
}

impl LogoutTool {
    pub fn new(users: Arc<UserStore>, manager: Arc<ConnectionManager>) -> Self {
        Self { users, manager }
    }
}

#[async_trait]
impl ToolProvider for LogoutTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "logout".to_string(),
            description: "End the current session".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, ctx: &RequestContext, _args: Value) -> Result<Value, ProviderError> {
        if !ctx.is_session() {
            return Err(ProviderError::Failed(
                "logout requires a session token".to_string(),
            ));
        }
        let hash = ctx.token_hash();
        match self.users.end_session(hash) {
            Some(username) => {
                self.manager.purge_by_hash(hash).await;
                tracing::info!(username = %username, "user logged out");
                Ok(json!({"status": "logged out", "username": username}))
            }
            None => Err(ProviderError::Failed("no active session".to_string())),
        }
    }
}

// ── saved connection management ──

#[derive(Deserialize)]
struct RegisterConnectionArgs {
    alias: String,
    url: String,
    #[serde(default = "default_maintenance_db")]
    maintenance_db: String,
    #[serde(default)]
    description: String,
}

fn default_maintenance_db() -> String {
    "postgres".to_string()
}

/// Registers an additional database connection under a unique alias.
pub struct RegisterConnectionTool {
    registry: Arc<SavedConnectionRegistry>,
}

impl RegisterConnectionTool {
    pub fn new(registry: Arc<SavedConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolProvider for RegisterConnectionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "register_connection".to_string(),
            description: "Register an additional database connection under an alias".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "alias": {"type": "string"},
                    "url": {"type": "string"},
                    "maintenance_db": {"type": "string"},
                    "description": {"type": "string"}
                },
                "required": ["alias", "url"]
            }),
        }
    }

    async fn call(&self, _ctx: &RequestContext, args: Value) -> Result<Value, ProviderError> {
        let args: RegisterConnectionArgs = parse_args(args)?;
        if args.alias.trim().is_empty() {
            return Err(ProviderError::InvalidParams(
                "alias must not be empty".to_string(),
            ));
        }
        let conn = self
            .registry
            .add(
                &args.alias,
                &args.url,
                &args.maintenance_db,
                &args.description,
            )
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        Ok(json!({
            "alias": conn.alias,
            "maintenance_db": conn.maintenance_db,
            "created_at": conn.created_at.to_rfc3339(),
        }))
    }
}

#[derive(Deserialize)]
struct UpdateConnectionArgs {
    alias: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Changes the URL and/or description of a registered connection.
pub struct UpdateConnectionTool {
    registry: Arc<SavedConnectionRegistry>,
}

impl UpdateConnectionTool {
    pub fn new(registry: Arc<SavedConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolProvider for UpdateConnectionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "update_connection".to_string(),
            description: "Update a registered database connection's URL or description"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "alias": {"type": "string"},
                    "url": {"type": "string"},
                    "description": {"type": "string"}
                },
                "required": ["alias"]
            }),
        }
    }

    async fn call(&self, _ctx: &RequestContext, args: Value) -> Result<Value, ProviderError> {
        let args: UpdateConnectionArgs = parse_args(args)?;
        if args.url.is_none() && args.description.is_none() {
            return Err(ProviderError::InvalidParams(
                "provide url and/or description".to_string(),
            ));
        }
        let conn = self
            .registry
            .update(&args.alias, args.url.as_deref(), args.description.as_deref())
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        Ok(json!({
            "alias": conn.alias,
            "description": conn.description,
            "updated_at": conn.updated_at.to_rfc3339(),
        }))
    }
}

#[derive(Deserialize)]
struct UnregisterConnectionArgs {
    alias: String,
}

pub struct UnregisterConnectionTool {
    registry: Arc<SavedConnectionRegistry>,
}

impl UnregisterConnectionTool {
    pub fn new(registry: Arc<SavedConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolProvider for UnregisterConnectionTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "unregister_connection".to_string(),
            description: "Remove a previously registered database connection".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"alias": {"type": "string"}},
                "required": ["alias"]
            }),
        }
    }

    async fn call(&self, _ctx: &RequestContext, args: Value) -> Result<Value, ProviderError> {
        let args: UnregisterConnectionArgs = parse_args(args)?;
        let removed = self
            .registry
            .remove(&args.alias)
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        Ok(json!({"removed": removed.alias}))
    }
}

/// Lists registered connections. Connection strings are never included.
pub struct ListConnectionsTool {
    registry: Arc<SavedConnectionRegistry>,
}

impl ListConnectionsTool {
    pub fn new(registry: Arc<SavedConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolProvider for ListConnectionsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "list_connections".to_string(),
            description: "List registered database connections".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _ctx: &RequestContext, _args: Value) -> Result<Value, ProviderError> {
        let connections: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|c| {
                json!({
                    "alias": c.alias,
                    "maintenance_db": c.maintenance_db,
                    "description": c.description,
                    "created_at": c.created_at.to_rfc3339(),
                    "updated_at": c.updated_at.to_rfc3339(),
                })
            })
            .collect();
        Ok(json!({"connections": connections}))
    }
}

// ── database catalog resource ──

/// Read-only catalog of the databases visible to the caller.
pub struct DatabaseCatalogResource {
    access: Arc<AccessChecker>,
    databases: Vec<DatabaseConfig>,
}

impl DatabaseCatalogResource {
    pub fn new(access: Arc<AccessChecker>, databases: Vec<DatabaseConfig>) -> Self {
        Self { access, databases }
    }
}

#[async_trait]
impl ResourceProvider for DatabaseCatalogResource {
    fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            uri: "pgmcp://databases".to_string(),
            name: "databases".to_string(),
            description: "Databases accessible to the current principal".to_string(),
            mime_type: "application/json".to_string(),
        }
    }

    async fn read(&self, ctx: &RequestContext) -> Result<Value, ProviderError> {
        let visible: Vec<Value> = self
            .access
            .accessible(ctx, &self.databases)
            .into_iter()
            .map(|db| {
                json!({
                    "name": db.name,
                    "description": db.description.clone().unwrap_or_default(),
                })
            })
            .collect();
        let text = serde_json::to_string_pretty(&visible)
            .map_err(|e| ProviderError::App(AppError::Internal(e.to_string())))?;
        Ok(json!([{
            "uri": "pgmcp://databases",
            "mimeType": "application/json",
            "text": text,
        }]))
    }
}
