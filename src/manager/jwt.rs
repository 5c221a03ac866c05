//! Stateless JWT token manager

use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use super::{Manager, PendingWrite, SigningMethod, Strategy};
use crate::session::Session;
use crate::{Error, Result};

/// Claims the gateway reads from an access token
#[derive(Debug, Deserialize)]
struct AccessClaims {
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

/// One accepted (algorithm, key) pair, ready to verify with
struct Verifier {
    key: DecodingKey,
    validation: Validation,
}

/// Validates access tokens as signed JWTs; no storage involved.
///
/// Every configured signing method is tried in order and the first one that
/// verifies wins. `exp` is enforced with zero leeway when present; `aud`
/// is not checked.
pub struct JwtManager {
    server_name: String,
    verifiers: Vec<Verifier>,
}

impl JwtManager {
    /// Build a manager for `server_name` accepting `methods`.
    ///
    /// # Errors
    ///
    /// [`Error::SecretMissing`] when no method carries a key, and
    /// [`Error::Config`] for an unknown algorithm or unreadable PEM key.
    pub fn new(server_name: impl Into<String>, methods: &[SigningMethod]) -> Result<Self> {
        if methods.is_empty() || methods.iter().any(|m| m.key.is_empty()) {
            return Err(Error::SecretMissing);
        }

        let verifiers = methods
            .iter()
            .map(build_verifier)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            server_name: server_name.into(),
            verifiers,
        })
    }

    fn decode(&self, token: &str) -> Option<AccessClaims> {
        for verifier in &self.verifiers {
            match jsonwebtoken::decode::<AccessClaims>(token, &verifier.key, &verifier.validation) {
                Ok(data) => return Some(data.claims),
                Err(e) => debug!(error = %e, "JWT rejected by signing method"),
            }
        }
        None
    }
}

fn build_verifier(method: &SigningMethod) -> Result<Verifier> {
    let algorithm = Algorithm::from_str(&method.alg)
        .map_err(|_| Error::Config(format!("Unsupported JWT algorithm: {}", method.alg)))?;

    let pem = method.key.as_bytes();
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => DecodingKey::from_secret(pem),
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::Config(format!("Invalid RSA key for {}: {e}", method.alg)))?,
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem)
            .map_err(|e| Error::Config(format!("Invalid EC key for {}: {e}", method.alg)))?,
        _ => DecodingKey::from_ed_pem(pem)
            .map_err(|e| Error::Config(format!("Invalid Ed25519 key: {e}")))?,
    };

    let mut validation = Validation::new(algorithm);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    Ok(Verifier { key, validation })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[async_trait]
impl Manager for JwtManager {
    fn set(&self, _access_token: &str, _session: &Session, _ttl_seconds: u64) -> PendingWrite {
        // nothing to persist: the token carries its own claims
        PendingWrite::ready(Ok(()))
    }

    async fn is_key_authorised(&self, access_token: &str) -> Option<Session> {
        let claims = self.decode(access_token)?;

        let expires_in = match claims.exp {
            Some(exp) => {
                let now = now_secs();
                if exp <= now {
                    return None;
                }
                exp - now
            }
            None => 0,
        };

        Some(Session {
            server_name: self.server_name.clone(),
            expires_in,
            client_id: claims.client_id.or(claims.sub).unwrap_or_default(),
            access_token: access_token.to_string(),
            token_type: "Bearer".to_string(),
        })
    }

    fn remove(&self, _access_token: &str) -> PendingWrite {
        PendingWrite::ready(Ok(()))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Jwt
    }
}
