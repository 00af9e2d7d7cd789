use crate::config::TokenSource;
use crate::types::error::{InboxError, Result};

/// Supplies the bearer credential for REST calls
///
/// Resolved on every request so rotated tokens are picked up without a restart.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Result<String>;
}

impl CredentialProvider for TokenSource {
    fn bearer_token(&self) -> Result<String> {
        match self {
            TokenSource::Raw(token) => Ok(token.clone()),
            TokenSource::Env { env } => std::env::var(env)
                .map(|t| t.trim().to_string())
                .map_err(|e| InboxError::Auth(format!("Cannot read token from ${}: {}", env, e))),
        }
    }
}
