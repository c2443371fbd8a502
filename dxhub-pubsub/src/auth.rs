//! Authentication header selection.

use std::fmt;

use crate::types::{Config, CredentialProvider, Error};

pub const API_KEY_HEADER: &str = "X-Api-Key";
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

/// The header an outgoing authenticated request carries, and where its value
/// comes from.
#[derive(Clone)]
pub struct AuthHeader {
    name: &'static str,
    provider: CredentialProvider,
}

impl AuthHeader {
    /// Pick the header for `config`. The API key provider wins when both are
    /// configured; `None` when neither is.
    pub fn select(config: &Config) -> Option<Self> {
        if let Some(provider) = &config.api_key_provider {
            return Some(Self {
                name: API_KEY_HEADER,
                provider: provider.clone(),
            });
        }
        config.auth_token_provider.as_ref().map(|provider| Self {
            name: AUTH_TOKEN_HEADER,
            provider: provider.clone(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolve the current credential. Never cached: call once per request.
    pub fn credential(&self) -> Result<AuthCredential, Error> {
        let value = (self.provider)().map_err(Error::Auth)?;
        Ok(AuthCredential {
            header: self.name,
            value,
        })
    }
}

impl fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthHeader")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A resolved header name/value pair for one request.
#[derive(Clone)]
pub struct AuthCredential {
    pub header: &'static str,
    pub value: Vec<u8>,
}

impl fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredential")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::BoxError;

    #[test]
    fn api_key_provider_selects_api_key_header() {
        let config = Config::new("group", "example.com").with_api_key(|| Ok(b"xyz".to_vec()));
        let auth = AuthHeader::select(&config).unwrap();
        assert_eq!(auth.name(), "X-Api-Key");
        assert_eq!(auth.credential().unwrap().value, b"xyz");
    }

    #[test]
    fn auth_token_provider_selects_auth_token_header() {
        let config = Config::new("group", "example.com").with_auth_token(|| Ok(b"abc".to_vec()));
        let auth = AuthHeader::select(&config).unwrap();
        assert_eq!(auth.name(), "X-Auth-Token");
        assert_eq!(auth.credential().unwrap().value, b"abc");
    }

    #[test]
    fn api_key_takes_precedence() {
        let config = Config::new("group", "example.com")
            .with_auth_token(|| Ok(b"abc".to_vec()))
            .with_api_key(|| Ok(b"xyz".to_vec()));
        let auth = AuthHeader::select(&config).unwrap();
        assert_eq!(auth.name(), API_KEY_HEADER);
        assert_eq!(auth.credential().unwrap().value, b"xyz");
    }

    #[test]
    fn no_provider_selects_nothing() {
        assert!(AuthHeader::select(&Config::new("group", "example.com")).is_none());
    }

    #[test]
    fn provider_is_called_for_every_credential() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = Config::new("group", "example.com").with_api_key(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("key-{n}").into_bytes())
        });
        let auth = AuthHeader::select(&config).unwrap();
        assert_eq!(auth.credential().unwrap().value, b"key-0");
        assert_eq!(auth.credential().unwrap().value, b"key-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn provider_failure_is_auth_error() {
        let config = Config::new("group", "example.com")
            .with_api_key(|| Err::<Vec<u8>, BoxError>("vault sealed".into()));
        let auth = AuthHeader::select(&config).unwrap();
        let err = auth.credential().unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.to_string().contains("vault sealed"));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = AuthCredential {
            header: API_KEY_HEADER,
            value: b"secret".to_vec(),
        };
        assert!(!format!("{credential:?}").contains("secret"));
    }
}
