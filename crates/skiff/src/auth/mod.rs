//! Cookie-derived identity.
//!
//! The bridge endpoints authorize from the connection's credentials on every
//! request: an HS256-signed session cookie, or a fixed development identity
//! when dev mode is on. There is no separate access-token mechanism.

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// User identity for dev mode.
const DEV_USER: &str = "dev";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

/// Authentication failure; callers translate this into a policy-violation
/// close on WebSocket endpoints.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing session cookie")]
    MissingCookie,
    #[error("invalid session token")]
    InvalidToken,
}

/// Session cookie claims.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Verifies session cookies.
#[derive(Clone)]
pub struct Authenticator {
    dev_mode: bool,
    cookie_name: String,
    decoding_key: Option<DecodingKey>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let secret = config.resolve_jwt_secret()?;
        if !config.dev_mode && secret.is_none() {
            anyhow::bail!("auth.jwt_secret is required unless dev_mode is enabled");
        }
        Ok(Self {
            dev_mode: config.dev_mode,
            cookie_name: config.cookie_name.clone(),
            decoding_key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
        })
    }

    /// Resolve the caller's identity from a `Cookie` header value.
    pub fn identify(&self, cookie_header: Option<&str>) -> Result<Identity, AuthError> {
        if self.dev_mode {
            return Ok(Identity {
                user_id: DEV_USER.to_string(),
            });
        }

        let header = cookie_header.ok_or(AuthError::MissingCookie)?;
        let token = cookie_value(header, &self.cookie_name).ok_or(AuthError::MissingCookie)?;

        let key = self.decoding_key.as_ref().ok_or(AuthError::InvalidToken)?;
        let data = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(Identity {
            user_id: data.claims.sub,
        })
    }
}

/// Extract one cookie's value from a `Cookie` header.
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, sub: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn authenticator(dev_mode: bool) -> Authenticator {
        Authenticator::new(&AuthConfig {
            dev_mode,
            jwt_secret: Some("test-secret".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn cookie_value_parses_multi_cookie_headers() {
        let header = "theme=dark; skiff_session=abc.def.ghi; lang=en";
        assert_eq!(cookie_value(header, "skiff_session"), Some("abc.def.ghi"));
        assert_eq!(cookie_value(header, "missing"), None);
    }

    #[test]
    fn valid_cookie_yields_identity() {
        let auth = authenticator(false);
        let header = format!("skiff_session={}", token("test-secret", "alice"));
        let identity = auth.identify(Some(&header)).unwrap();
        assert_eq!(identity.user_id, "alice");
    }

    #[test]
    fn bad_signature_is_rejected() {
        let auth = authenticator(false);
        let header = format!("skiff_session={}", token("wrong-secret", "alice"));
        assert!(matches!(
            auth.identify(Some(&header)),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn missing_cookie_is_rejected() {
        let auth = authenticator(false);
        assert!(matches!(auth.identify(None), Err(AuthError::MissingCookie)));
        assert!(matches!(
            auth.identify(Some("theme=dark")),
            Err(AuthError::MissingCookie)
        ));
    }

    #[test]
    fn dev_mode_bypasses_cookies() {
        let auth = authenticator(true);
        let identity = auth.identify(None).unwrap();
        assert_eq!(identity.user_id, "dev");
    }

    #[test]
    fn secret_required_outside_dev_mode() {
        let result = Authenticator::new(&AuthConfig {
            dev_mode: false,
            jwt_secret: None,
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
