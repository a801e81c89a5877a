use std::sync::Arc;

use crate::auth::token_store::TokenStore;
use crate::auth::RequestContext;
use crate::config::DatabaseConfig;

/// Decides which configured databases a principal can see and use.
///
/// Rules, in order:
/// 1. auth disabled (the stdio transport runs this way by contract):
///    everything is accessible
/// 2. service token with a database binding: only that database; an
///    unknown binding yields the empty set
/// 3. unbound service token: the first configured database
/// 4. session principal: databases whose `available_to_users` is empty
///    or names the user
/// 5. unauthenticated: nothing
pub struct AccessChecker {
    auth_enabled: bool,
    tokens: Arc<TokenStore>,
}

impl AccessChecker {
    pub fn new(auth_enabled: bool, tokens: Arc<TokenStore>) -> Self {
        Self {
            auth_enabled,
            tokens,
        }
    }

    /// The service token's database binding, if the principal is a service
    /// token and its record carries one.
    pub fn bound_database(&self, ctx: &RequestContext) -> Option<String> {
        if !ctx.is_service_token() {
            return None;
        }
        self.tokens
            .get_by_hash(ctx.token_hash())
            .and_then(|t| t.bound_database)
    }

    /// The subset of `databases` visible to the principal, preserving
    /// configuration order.
    pub fn accessible<'a>(
        &self,
        ctx: &RequestContext,
        databases: &'a [DatabaseConfig],
    ) -> Vec<&'a DatabaseConfig> {
        if !self.auth_enabled {
            return databases.iter().collect();
        }

        if ctx.is_service_token() {
            if let Some(bound) = self.bound_database(ctx) {
                return databases.iter().filter(|db| db.name == bound).collect();
            }
            return databases.first().into_iter().collect();
        }

        if ctx.is_session() {
            let username = ctx.username();
            return databases
                .iter()
                .filter(|db| {
                    db.available_to_users.is_empty()
                        || db.available_to_users.iter().any(|u| u == username)
                })
                .collect();
        }

        Vec::new()
    }

    /// True when the named database is in the principal's accessible set.
    pub fn can_access(
        &self,
        ctx: &RequestContext,
        databases: &[DatabaseConfig],
        name: &str,
    ) -> bool {
        self.accessible(ctx, databases)
            .iter()
            .any(|db| db.name == name)
    }
}
