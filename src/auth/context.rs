/// The authenticated identity attached to a request.
///
/// On the request path only the auth middleware constructs one; it is
/// injected into request extensions and read-only for the rest of the
/// request.
/// Accessors return the zero value (empty string / false) when a field was
/// never set, so handlers do not need to distinguish "absent" from "empty".
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token_hash: String,
    username: String,
    is_service_token: bool,
    ip_address: String,
}

impl RequestContext {
    /// An unauthenticated context carrying only the client IP. Used for the
    /// login pass-through; public paths carry no context at all.
    pub fn anonymous(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            ..Self::default()
        }
    }

    /// A service-token principal.
    pub fn service(token_hash: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            token_hash: token_hash.into(),
            username: String::new(),
            is_service_token: true,
            ip_address: ip_address.into(),
        }
    }

    /// A session principal bound to a username.
    pub fn session(
        token_hash: impl Into<String>,
        username: impl Into<String>,
        ip_address: impl Into<String>,
    ) -> Self {
        Self {
            token_hash: token_hash.into(),
            username: username.into(),
            is_service_token: false,
            ip_address: ip_address.into(),
        }
    }

    /// SHA-256 hex digest of the presented credential. Empty when the
    /// request was not authenticated. Keys the principal's connection pools.
    pub fn token_hash(&self) -> &str {
        &self.token_hash
    }

    /// Username of a session principal; empty for service tokens and
    /// unauthenticated requests.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_service_token(&self) -> bool {
        self.is_service_token
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn is_authenticated(&self) -> bool {
        !self.token_hash.is_empty()
    }

    /// True for a validated session-token principal.
    pub fn is_session(&self) -> bool {
        !self.is_service_token && !self.username.is_empty()
    }
}
