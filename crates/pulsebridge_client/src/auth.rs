//! Authentication descriptors.

use std::fmt;

use pulsebridge_config::ClientSettings;
use pulsebridge_message::AuthData;

use crate::error::{ConnectionError, Result};

/// How a connection authenticates. Connections are keyed by endpoint and
/// descriptor, so two descriptors that differ in any field get separate
/// transports.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub enum Authentication {
    #[default]
    None,
    Token(String),
    Basic {
        username: String,
        password: String,
    },
    Tls {
        cert_path: String,
        key_path: String,
    },
    OAuth2 {
        issuer_url: String,
        client_id: String,
        audience: Option<String>,
    },
}

impl Authentication {
    pub fn method(&self) -> &'static str {
        match self {
            Authentication::None => "none",
            Authentication::Token(_) => "token",
            Authentication::Basic { .. } => "basic",
            Authentication::Tls { .. } => "tls",
            Authentication::OAuth2 { .. } => "oauth2",
        }
    }

    /// Credentials as presented in the connect handshake.
    pub fn to_auth_data(&self) -> AuthData {
        let data = match self {
            Authentication::None => return AuthData::anonymous(),
            Authentication::Token(token) => token.clone(),
            Authentication::Basic { username, password } => format!("{username}:{password}"),
            Authentication::Tls {
                cert_path,
                key_path,
            } => format!("cert={cert_path};key={key_path}"),
            Authentication::OAuth2 {
                issuer_url,
                client_id,
                audience,
            } => format!(
                "issuer_url={issuer_url};client_id={client_id};audience={}",
                audience.as_deref().unwrap_or_default()
            ),
        };
        AuthData {
            method: self.method().to_string(),
            data,
        }
    }

    /// Build the descriptor named by `settings.auth_method`.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let missing = |what: &str| {
            ConnectionError::AuthRejected(format!(
                "{} authentication requires {what}",
                settings.auth_method
            ))
        };

        let auth = match settings.auth_method.to_ascii_lowercase().as_str() {
            "" | "none" => Authentication::None,
            "token" | "jwt" => Authentication::Token(
                settings.auth_token.clone().ok_or_else(|| missing("auth_token"))?,
            ),
            "basic" => Authentication::Basic {
                username: settings
                    .auth_username
                    .clone()
                    .ok_or_else(|| missing("auth_username"))?,
                password: settings
                    .auth_password
                    .clone()
                    .ok_or_else(|| missing("auth_password"))?,
            },
            "tls" => Authentication::Tls {
                cert_path: settings
                    .tls_cert_path
                    .clone()
                    .ok_or_else(|| missing("tls_cert_path"))?,
                key_path: settings
                    .tls_key_path
                    .clone()
                    .ok_or_else(|| missing("tls_key_path"))?,
            },
            "oauth2" => Authentication::OAuth2 {
                issuer_url: settings
                    .oauth2_issuer_url
                    .clone()
                    .ok_or_else(|| missing("oauth2_issuer_url"))?,
                client_id: settings
                    .oauth2_client_id
                    .clone()
                    .ok_or_else(|| missing("oauth2_client_id"))?,
                audience: settings.oauth2_audience.clone(),
            },
            method @ ("kerberos" | "athenz") => {
                return Err(ConnectionError::AuthRejected(format!(
                    "{method} authentication is not supported"
                ))
                .into());
            }
            other => {
                return Err(ConnectionError::AuthRejected(format!(
                    "unknown auth method '{other}'"
                ))
                .into());
            }
        };
        Ok(auth)
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::None => f.write_str("None"),
            Authentication::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
            Authentication::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Authentication::Tls {
                cert_path,
                key_path,
            } => f
                .debug_struct("Tls")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            Authentication::OAuth2 {
                issuer_url,
                client_id,
                audience,
            } => f
                .debug_struct("OAuth2")
                .field("issuer_url", issuer_url)
                .field("client_id", client_id)
                .field("audience", audience)
                .finish(),
        }
    }
}
