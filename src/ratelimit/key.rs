//! Counter key derivation and handling.

use super::policy::{AuthAction, LimitLayer};
use crate::error::AuthLimitError;

/// The per-request inputs the limiter needs from the caller.
///
/// The client IP is always required. Email and token are best-effort fields
/// parsed from the request body; when a layer's field is missing the key
/// degrades to IP-only addressing rather than failing the request.
///
/// IPs are keyed verbatim. Resolving the real client address from proxy
/// headers, and any IPv6 normalization, is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: String,
    pub email: Option<String>,
    pub token: Option<String>,
}

impl RequestContext {
    /// Create a context with only the client IP.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            email: None,
            token: None,
        }
    }

    /// Attach the email parsed from the request body.
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Attach the reset token parsed from the request body.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// A key that uniquely identifies one counter.
///
/// Uniqueness is over the full (action, layer, identifier) tuple, so the
/// same IP gets independent counters per action and per layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    pub action: AuthAction,
    pub layer: LimitLayer,
    /// Raw IP, lower-cased email, or opaque token
    pub identifier: String,
}

impl LimitKey {
    /// Create a key with a verbatim identifier.
    pub fn new(action: AuthAction, layer: LimitLayer, identifier: impl Into<String>) -> Self {
        Self {
            action,
            layer,
            identifier: identifier.into(),
        }
    }

    /// Derive the key for a request.
    ///
    /// Emails are case-folded so case variants of one address share a
    /// counter. A missing email/token falls back to the IP for that layer.
    pub fn derive(action: AuthAction, layer: LimitLayer, ctx: &RequestContext) -> Self {
        let identifier = match layer {
            LimitLayer::Ip => ctx.ip.clone(),
            LimitLayer::Email => match &ctx.email {
                Some(email) => email.to_lowercase(),
                None => ctx.ip.clone(),
            },
            LimitLayer::Token => match &ctx.token {
                Some(token) => token.clone(),
                None => ctx.ip.clone(),
            },
        };

        Self {
            action,
            layer,
            identifier,
        }
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.action, self.layer, self.identifier)
    }
}

impl std::str::FromStr for LimitKey {
    type Err = AuthLimitError;

    /// Parse the serialized `action:layer:identifier` form. The identifier
    /// may itself contain colons (IPv6 addresses), so only the first two
    /// separators are structural.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');

        let action = parts
            .next()
            .and_then(AuthAction::from_name)
            .ok_or_else(|| AuthLimitError::Config(format!("Invalid rate limit key: {}", s)))?;
        let layer = parts
            .next()
            .and_then(LimitLayer::from_name)
            .ok_or_else(|| AuthLimitError::Config(format!("Invalid rate limit key: {}", s)))?;
        let identifier = parts
            .next()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthLimitError::Config(format!("Invalid rate limit key: {}", s)))?;

        Ok(Self::new(action, layer, identifier))
    }
}
