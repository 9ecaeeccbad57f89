//! Session authentication and namespace authorization.
//!
//! Tokens are HS256 JWTs whose `sub` claim is the role; `jwt` is accepted as
//! another name for `token`. Basic credentials are `user:password` checked
//! against a configured table. TLS sessions are identified by their
//! certificate path and OAuth2 sessions by client id and issuer. When no
//! check is configured every session is anonymous.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use pulsebridge_message::{AuthData, ServerError};
use serde::{Deserialize, Serialize};

pub const ANONYMOUS_ROLE: &str = "anonymous";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone, Default)]
pub struct AuthPolicy {
    pub allow_anonymous: bool,
    pub jwt_secret: Option<String>,
    /// user → password
    pub basic_users: HashMap<String, String>,
    /// certificate path → role
    pub tls_roles: HashMap<String, String>,
    /// OAuth2 client id → issuer url it must come from
    pub oauth2_clients: HashMap<String, String>,
    /// namespace → roles allowed to use it. Namespaces not listed are open.
    pub namespace_roles: HashMap<String, HashSet<String>>,
}

impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPolicy")
            .field("allow_anonymous", &self.allow_anonymous)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("basic_users", &self.basic_users.keys().collect::<Vec<_>>())
            .field("tls_roles", &self.tls_roles)
            .field("oauth2_clients", &self.oauth2_clients)
            .field("namespace_roles", &self.namespace_roles)
            .finish()
    }
}

impl AuthPolicy {
    /// Whether any credential check is configured.
    pub fn enabled(&self) -> bool {
        self.jwt_secret.is_some()
            || !self.basic_users.is_empty()
            || !self.tls_roles.is_empty()
            || !self.oauth2_clients.is_empty()
    }

    /// Resolve the role for a connect handshake.
    pub fn authenticate(&self, auth: &AuthData) -> Result<String, ServerError> {
        if !self.enabled() {
            return Ok(ANONYMOUS_ROLE.to_string());
        }

        match auth.method.as_str() {
            "none" | "" if self.allow_anonymous => Ok(ANONYMOUS_ROLE.to_string()),
            "none" | "" => Err(failed("anonymous access is disabled")),
            "token" | "jwt" => {
                let secret = self
                    .jwt_secret
                    .as_deref()
                    .ok_or_else(|| failed("token authentication is not configured"))?;
                decode::<Claims>(
                    &auth.data,
                    &DecodingKey::from_secret(secret.as_bytes()),
                    &Validation::default(),
                )
                .map(|data| data.claims.sub)
                .map_err(|e| failed(&format!("invalid token: {e}")))
            }
            "basic" => {
                let (user, password) = auth
                    .data
                    .split_once(':')
                    .ok_or_else(|| failed("malformed basic credentials"))?;
                match self.basic_users.get(user) {
                    Some(expected) if expected == password => Ok(user.to_string()),
                    _ => Err(failed("invalid credentials")),
                }
            }
            "tls" => {
                let fields = fields(&auth.data);
                let cert = fields
                    .get("cert")
                    .ok_or_else(|| failed("malformed tls credentials"))?;
                self.tls_roles
                    .get(*cert)
                    .cloned()
                    .ok_or_else(|| failed("untrusted certificate"))
            }
            "oauth2" => {
                let fields = fields(&auth.data);
                let (Some(client_id), Some(issuer)) = (fields.get("client_id"), fields.get("issuer_url"))
                else {
                    return Err(failed("malformed oauth2 credentials"));
                };
                match self.oauth2_clients.get(*client_id) {
                    Some(expected) if expected == issuer => Ok(client_id.to_string()),
                    _ => Err(failed("unknown oauth2 client")),
                }
            }
            other => Err(failed(&format!("unsupported auth method '{other}'"))),
        }
    }

    /// Check that `role` may use `namespace`.
    pub fn authorize(&self, role: &str, namespace: &str) -> Result<(), ServerError> {
        match self.namespace_roles.get(namespace) {
            Some(roles) if !roles.contains(role) => Err(ServerError::AuthorizationFailed(
                format!("role '{role}' may not access namespace '{namespace}'"),
            )),
            _ => Ok(()),
        }
    }
}

/// Split `k=v;k=v` credential data.
fn fields(data: &str) -> HashMap<&str, &str> {
    data.split(';')
        .filter_map(|pair| pair.split_once('='))
        .collect()
}

fn failed(reason: &str) -> ServerError {
    ServerError::AuthenticationFailed(reason.to_string())
}

/// Mint an HS256 token for `subject`, valid for `ttl`.
pub fn issue_token(
    secret: &str,
    subject: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));
    let claims = Claims {
        sub: subject.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
