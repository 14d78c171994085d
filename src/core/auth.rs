use tracing::warn;

use super::config::AuthConfig;

/// Bcrypt cost factor for hashing admin tokens.
const BCRYPT_COST: u32 = 10;

/// Outcome of checking an `Authorization: Bearer` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    /// Header absent or not a bearer token.
    Missing,
    /// Well-formed but not one of the configured tokens.
    Forbidden,
}

/// Guards the catalog synchronization trigger.
///
/// Tokens are hashed with bcrypt at startup and only the hashes are kept.
/// With no tokens configured the guard runs in open mode and accepts every
/// request, which matches an unauthenticated deployment.
#[derive(Debug)]
pub struct AdminAuth {
    token_hashes: Vec<String>,
    open_mode: bool,
}

impl AdminAuth {
    pub fn new(config: &AuthConfig) -> Self {
        let open_mode = config.admin_bearer_tokens.is_empty();
        if open_mode {
            warn!("no admin bearer tokens configured, sync endpoint is open");
        }
        let token_hashes = config
            .admin_bearer_tokens
            .iter()
            .filter_map(|t| bcrypt::hash(t, BCRYPT_COST).ok())
            .collect();
        Self {
            token_hashes,
            open_mode,
        }
    }

    pub fn is_open_mode(&self) -> bool {
        self.open_mode
    }

    /// Check a bearer token (the part after `Bearer `).
    pub fn check_bearer_token(&self, token: Option<&str>) -> TokenStatus {
        if self.open_mode {
            return TokenStatus::Valid;
        }
        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return TokenStatus::Missing,
        };
        let matched = self
            .token_hashes
            .iter()
            .any(|hash| bcrypt::verify(token, hash).unwrap_or(false));
        if matched {
            TokenStatus::Valid
        } else {
            TokenStatus::Forbidden
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with(tokens: &[&str]) -> AdminAuth {
        AdminAuth::new(&AuthConfig {
            admin_bearer_tokens: tokens.iter().map(|t| t.to_string()).collect(),
        })
    }

    #[test]
    fn test_open_mode_accepts_everything() {
        let auth = auth_with(&[]);
        assert!(auth.is_open_mode());
        assert_eq!(auth.check_bearer_token(None), TokenStatus::Valid);
        assert_eq!(auth.check_bearer_token(Some("x")), TokenStatus::Valid);
    }

    #[test]
    fn test_configured_tokens() {
        let auth = auth_with(&["at_admin_1"]);
        assert!(!auth.is_open_mode());
        assert_eq!(auth.check_bearer_token(Some("at_admin_1")), TokenStatus::Valid);
        assert_eq!(auth.check_bearer_token(Some("at_other")), TokenStatus::Forbidden);
        assert_eq!(auth.check_bearer_token(Some("")), TokenStatus::Missing);
        assert_eq!(auth.check_bearer_token(None), TokenStatus::Missing);
    }
}
