//! Channel authentication boundary.
//!
//! Token issuance and verification belong to an external identity service;
//! the gateway only needs a yes/no with a principal name. The default
//! implementation checks the shared cluster token.

use pkg_types::error::Error;

/// Identity attached to an authenticated session.
#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, Error>;
}

/// Verifies against the single shared cluster token.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Principal, Error> {
        if token.is_empty() {
            return Err(Error::AuthFailed("missing token".into()));
        }
        if token != self.token {
            return Err(Error::AuthFailed("invalid token".into()));
        }
        Ok(Principal {
            name: "cluster".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_verifier() {
        let v = StaticTokenVerifier::new("secret");
        assert!(v.verify("secret").is_ok());
        assert!(v.verify("nope").is_err());
        assert!(v.verify("").is_err());
    }
}
