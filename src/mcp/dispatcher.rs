use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::protocol::{codes, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION, PROTOCOL_VERSION};
use super::providers::{PromptProvider, ProviderError, ResourceProvider, ToolProvider};
use crate::auth::RequestContext;
use crate::config::DatabaseConfig;
use crate::db::AccessChecker;
use crate::error::AppError;

const SERVER_NAME: &str = env!("CARGO_PKG_NAME");
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default = "empty_object")]
    arguments: Value,
}

#[derive(Deserialize)]
struct ResourceReadParams {
    uri: String,
}

#[derive(Deserialize)]
struct PromptGetParams {
    name: String,
    #[serde(default = "empty_object")]
    arguments: Value,
}

#[derive(Deserialize)]
struct SelectDatabaseParams {
    name: String,
}

fn empty_object() -> Value {
    json!({})
}

/// Routes parsed JSON-RPC requests to tool/resource/prompt providers,
/// carrying the request's principal context into every handler.
///
/// Everything past the auth middleware answers HTTP 200; failures are
/// JSON-RPC error envelopes.
pub struct Dispatcher {
    tools: Vec<Arc<dyn ToolProvider>>,
    resources: Vec<Arc<dyn ResourceProvider>>,
    prompts: Vec<Arc<dyn PromptProvider>>,
    access: Arc<AccessChecker>,
    databases: Vec<DatabaseConfig>,
    /// Per-principal database selection, keyed by token hash.
    selections: Mutex<HashMap<String, String>>,
}

impl Dispatcher {
    pub fn new(access: Arc<AccessChecker>, databases: Vec<DatabaseConfig>) -> Self {
        Self {
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            access,
            databases,
            selections: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_tool(&mut self, tool: Arc<dyn ToolProvider>) {
        self.tools.push(tool);
    }

    pub fn register_resource(&mut self, resource: Arc<dyn ResourceProvider>) {
        self.resources.push(resource);
    }

    pub fn register_prompt(&mut self, prompt: Arc<dyn PromptProvider>) {
        self.prompts.push(prompt);
    }

    /// The principal's selected database, defaulting to the first
    /// accessible one.
    pub fn selected_database(&self, ctx: &RequestContext) -> Option<String> {
        let selections = self.selections.lock().unwrap();
        if let Some(name) = selections.get(ctx.token_hash()) {
            return Some(name.clone());
        }
        self.access
            .accessible(ctx, &self.databases)
            .first()
            .map(|db| db.name.clone())
    }

    /// Parse raw body bytes and dispatch. `None` means no response goes on
    /// the wire (notification or malformed notification).
    pub async fn handle(&self, ctx: &RequestContext, body: &[u8]) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable JSON-RPC body");
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    codes::PARSE_ERROR,
                    "parse error",
                ));
            }
        };
        self.dispatch(ctx, request).await
    }

    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        if request.jsonrpc != JSONRPC_VERSION {
            let id = request.id.unwrap_or(Value::Null);
            return Some(JsonRpcResponse::error(
                id,
                codes::INVALID_REQUEST,
                "invalid request",
            ));
        }

        if request.is_notification() {
            // The only notification with meaning here is
            // notifications/initialized, and it carries no state.
            tracing::debug!(method = %request.method, "notification received");
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or_else(empty_object);

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::result(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {},
                        "resources": {},
                        "prompts": {},
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": SERVER_VERSION,
                    },
                }),
            ),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|t| serde_json::to_value(t.descriptor()).unwrap_or_default())
                    .collect();
                JsonRpcResponse::result(id, json!({"tools": tools}))
            }
            "tools/call" => self.call_tool(ctx, id, params).await,
            "resources/list" => {
                let resources: Vec<Value> = self
                    .resources
                    .iter()
                    .map(|r| serde_json::to_value(r.descriptor()).unwrap_or_default())
                    .collect();
                JsonRpcResponse::result(id, json!({"resources": resources}))
            }
            "resources/read" => self.read_resource(ctx, id, params).await,
            "prompts/list" => {
                let prompts: Vec<Value> = self
                    .prompts
                    .iter()
                    .map(|p| serde_json::to_value(p.descriptor()).unwrap_or_default())
                    .collect();
                JsonRpcResponse::result(id, json!({"prompts": prompts}))
            }
            "prompts/get" => self.get_prompt(ctx, id, params).await,
            "pgedge/listDatabases" => self.list_databases(ctx, id),
            "pgedge/selectDatabase" => self.select_database(ctx, id, params),
            _ => JsonRpcResponse::error(id, codes::METHOD_NOT_FOUND, "method not found"),
        };
        Some(response)
    }

    async fn call_tool(&self, ctx: &RequestContext, id: Value, params: Value) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, e.to_string());
            }
        };
        let Some(tool) = self
            .tools
            .iter()
            .find(|t| t.descriptor().name == params.name)
        else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                format!("unknown tool: {}", params.name),
            );
        };

        match tool.call(ctx, params.arguments).await {
            Ok(value) => JsonRpcResponse::result(
                id,
                json!({
                    "content": [{"type": "text", "text": value.to_string()}],
                    "isError": false,
                }),
            ),
            Err(ProviderError::InvalidParams(msg)) => {
                JsonRpcResponse::error(id, codes::INVALID_PARAMS, msg)
            }
            Err(ProviderError::Failed(msg)) => JsonRpcResponse::result(
                id,
                json!({
                    "content": [{"type": "text", "text": msg}],
                    "isError": true,
                }),
            ),
            Err(ProviderError::App(e)) => {
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, sanitize(&e))
            }
        }
    }

    async fn read_resource(
        &self,
        ctx: &RequestContext,
        id: Value,
        params: Value,
    ) -> JsonRpcResponse {
        let params: ResourceReadParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(id, codes::INVALID_PARAMS, e.to_string()),
        };
        let Some(resource) = self
            .resources
            .iter()
            .find(|r| r.descriptor().uri == params.uri)
        else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                format!("unknown resource: {}", params.uri),
            );
        };

        match resource.read(ctx).await {
            Ok(contents) => JsonRpcResponse::result(id, json!({"contents": contents})),
            Err(ProviderError::InvalidParams(msg)) => {
                JsonRpcResponse::error(id, codes::INVALID_PARAMS, msg)
            }
            Err(ProviderError::Failed(msg)) => {
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, msg)
            }
            Err(ProviderError::App(e)) => {
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, sanitize(&e))
            }
        }
    }

    async fn get_prompt(&self, ctx: &RequestContext, id: Value, params: Value) -> JsonRpcResponse {
        let params: PromptGetParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(id, codes::INVALID_PARAMS, e.to_string()),
        };
        let Some(prompt) = self
            .prompts
            .iter()
            .find(|p| p.descriptor().name == params.name)
        else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                format!("unknown prompt: {}", params.name),
            );
        };

        match prompt.get(ctx, params.arguments).await {
            Ok(value) => JsonRpcResponse::result(id, value),
            Err(ProviderError::InvalidParams(msg)) => {
                JsonRpcResponse::error(id, codes::INVALID_PARAMS, msg)
            }
            Err(ProviderError::Failed(msg)) => {
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, msg)
            }
            Err(ProviderError::App(e)) => {
                JsonRpcResponse::error(id, codes::INTERNAL_ERROR, sanitize(&e))
            }
        }
    }

    fn list_databases(&self, ctx: &RequestContext, id: Value) -> JsonRpcResponse {
        let selected = self.selected_database(ctx);
        let databases: Vec<Value> = self
            .access
            .accessible(ctx, &self.databases)
            .into_iter()
            .map(|db| {
                json!({
                    "name": db.name,
                    "description": db.description.clone().unwrap_or_default(),
                    "selected": selected.as_deref() == Some(db.name.as_str()),
                })
            })
            .collect();
        JsonRpcResponse::result(id, json!({"databases": databases}))
    }

    fn select_database(&self, ctx: &RequestContext, id: Value, params: Value) -> JsonRpcResponse {
        let params: SelectDatabaseParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return JsonRpcResponse::error(id, codes::INVALID_PARAMS, e.to_string()),
        };
        if !self.access.can_access(ctx, &self.databases, &params.name) {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                "unknown or inaccessible database",
            );
        }
        self.selections
            .lock()
            .unwrap()
            .insert(ctx.token_hash().to_string(), params.name.clone());
        JsonRpcResponse::result(id, json!({"selected": params.name}))
    }
}

/// Client-safe rendering of internal handler errors. Connection strings
/// and implementation detail never reach the response; the cause is
/// logged here and nowhere else.
fn sanitize(error: &AppError) -> String {
    match error {
        AppError::Database(e) => {
            tracing::error!(error = %e, "database error in handler");
            "database error".to_string()
        }
        AppError::Internal(msg) => {
            tracing::error!(error = %msg, "internal error in handler");
            "internal error".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::rate_limit::RateLimiter;
    use crate::auth::token_store::{hash_token, TokenStore};
    use crate::auth::user_store::UserStore;
    use crate::config::{AuthConfig, PoolConfig, RateLimitConfig};
    use crate::db::ConnectionManager;
    use crate::mcp::tools::LoginTool;

    struct Fixture {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
        service_hash: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::open(dir.path().join("tokens.yaml")).unwrap());
        let (_, hash) = TokenStore::generate();
        tokens.add(&hash, "test", None, None).unwrap();

        let users = Arc::new(UserStore::open(dir.path().join("users.yaml")).unwrap());
        users.add_user("alice", "secret", "").unwrap();

        let access = Arc::new(AccessChecker::new(true, tokens));
        let databases = vec![
            DatabaseConfig {
                name: "main".to_string(),
                url: "postgres://localhost/main".to_string(),
                available_to_users: Vec::new(),
                description: None,
            },
            DatabaseConfig {
                name: "analytics".to_string(),
                url: "postgres://localhost/analytics".to_string(),
                available_to_users: vec!["alice".to_string()],
                description: None,
            },
        ];
        let mut dispatcher = Dispatcher::new(access, databases);
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let manager = Arc::new(ConnectionManager::new(PoolConfig::default()));
        dispatcher.register_tool(Arc::new(LoginTool::new(
            users,
            limiter,
            manager,
            &AuthConfig::default(),
        )));
        Fixture {
            _dir: dir,
            dispatcher,
            service_hash: hash,
        }
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f.dispatcher.handle(&ctx, b"{not json").await.unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn wrong_jsonrpc_version_is_invalid_request() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(&ctx, br#"{"jsonrpc":"1.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(
                &ctx,
                br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(&ctx, br#"{"jsonrpc":"2.0","id":7,"method":"no/such"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, codes::METHOD_NOT_FOUND);
        let raw = serde_json::to_value(&resp).unwrap();
        assert_eq!(raw["id"], 7);
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(&ctx, br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn tools_list_includes_login() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(&ctx, br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].clone();
        assert!(tools
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["name"] == "login"));
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let f = fixture();
        let ctx = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(
                &ctx,
                br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"nope"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn login_failure_surfaces_as_tool_error_result() {
        let f = fixture();
        let ctx = RequestContext::anonymous("10.0.0.1");
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"login","arguments":{"username":"alice","password":"wrong"}}}"#;
        let resp = f.dispatcher.handle(&ctx, body).await.unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(
            result["content"][0]["text"],
            "invalid username or password"
        );
    }

    #[tokio::test]
    async fn login_success_returns_session_token_content() {
        let f = fixture();
        let ctx = RequestContext::anonymous("10.0.0.1");
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"login","arguments":{"username":"alice","password":"secret"}}}"#;
        let resp = f.dispatcher.handle(&ctx, body).await.unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert!(payload["session_token"].as_str().unwrap().len() > 32);
    }

    #[tokio::test]
    async fn select_database_respects_access_rules() {
        let f = fixture();
        let service = RequestContext::service(f.service_hash.clone(), "10.0.0.1");
        // Unbound service token only sees the first database.
        let resp = f
            .dispatcher
            .handle(
                &service,
                br#"{"jsonrpc":"2.0","id":1,"method":"pgedge/selectDatabase","params":{"name":"analytics"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, codes::INVALID_PARAMS);

        let session = RequestContext::session(hash_token("s"), "alice", "10.0.0.1");
        let resp = f
            .dispatcher
            .handle(
                &session,
                br#"{"jsonrpc":"2.0","id":2,"method":"pgedge/selectDatabase","params":{"name":"analytics"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["selected"], "analytics");
        assert_eq!(
            f.dispatcher.selected_database(&session).as_deref(),
            Some("analytics")
        );

        // listDatabases reflects the selection.
        let resp = f
            .dispatcher
            .handle(
                &session,
                br#"{"jsonrpc":"2.0","id":3,"method":"pgedge/listDatabases"}"#,
            )
            .await
            .unwrap();
        let dbs = resp.result.unwrap()["databases"].clone();
        let analytics = dbs
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["name"] == "analytics")
            .unwrap()
            .clone();
        assert_eq!(analytics["selected"], true);
    }
}
