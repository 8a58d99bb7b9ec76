//! Limit policies and the registry that maps (action, layer) pairs to them.
//!
//! The registry is built once at startup and never mutated afterwards. A
//! pair with no configured policy is unregulated: the caller lets the
//! request through with no metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The authentication actions that can be throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Login,
    Register,
    ForgotPassword,
    ResetPassword,
}

impl AuthAction {
    /// The name used in serialized keys and log fields.
    pub fn as_name(&self) -> &'static str {
        match self {
            AuthAction::Login => "login",
            AuthAction::Register => "register",
            AuthAction::ForgotPassword => "forgot_password",
            AuthAction::ResetPassword => "reset_password",
        }
    }

    /// Parse a serialized action name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "login" => Some(AuthAction::Login),
            "register" => Some(AuthAction::Register),
            "forgot_password" => Some(AuthAction::ForgotPassword),
            "reset_password" => Some(AuthAction::ResetPassword),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_name())
    }
}

/// The dimension along which an action is throttled.
///
/// Each layer keeps its own counters, so the same request can be checked
/// against an IP budget and an email budget independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitLayer {
    Ip,
    Email,
    Token,
}

impl LimitLayer {
    pub fn as_name(&self) -> &'static str {
        match self {
            LimitLayer::Ip => "ip",
            LimitLayer::Email => "email",
            LimitLayer::Token => "token",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ip" => Some(LimitLayer::Ip),
            "email" => Some(LimitLayer::Email),
            "token" => Some(LimitLayer::Token),
            _ => None,
        }
    }
}

impl std::fmt::Display for LimitLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_name())
    }
}

/// An attempt budget for one (action, layer) pair.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    /// Maximum attempts allowed within the window
    pub max_attempts: u32,
    /// Fixed window duration; the counter resets entirely when it elapses
    pub window: chrono::Duration,
    /// Human-readable message returned on denial
    pub message: String,
    /// Delete the counter after a successful downstream response, so a
    /// successful authentication forgives prior failed attempts
    pub clear_on_success: bool,
}

/// Serde form of a policy, as it appears in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub window_secs: u64,
    pub message: String,
    #[serde(default)]
    pub clear_on_success: bool,
}

impl From<PolicyConfig> for LimitPolicy {
    fn from(config: PolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            window: chrono::Duration::seconds(config.window_secs as i64),
            message: config.message,
            clear_on_success: config.clear_on_success,
        }
    }
}

/// Immutable mapping from (action, layer) to its policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    table: HashMap<(AuthAction, LimitLayer), LimitPolicy>,
}

impl PolicyRegistry {
    /// Create an empty registry. Every pair is unregulated until inserted.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policy table for the protected authentication routes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.insert(
            AuthAction::Login,
            LimitLayer::Ip,
            LimitPolicy {
                max_attempts: 5,
                window: chrono::Duration::minutes(15),
                message: "Too many login attempts from this IP. Try again in 15 minutes."
                    .to_string(),
                clear_on_success: true,
            },
        );
        registry.insert(
            AuthAction::Login,
            LimitLayer::Email,
            LimitPolicy {
                max_attempts: 3,
                window: chrono::Duration::hours(1),
                message: "Too many login attempts for this email. Try again in 1 hour."
                    .to_string(),
                clear_on_success: true,
            },
        );
        registry.insert(
            AuthAction::Register,
            LimitLayer::Ip,
            LimitPolicy {
                max_attempts: 3,
                window: chrono::Duration::hours(1),
                message: "Too many registration attempts from this IP. Try again in 1 hour."
                    .to_string(),
                clear_on_success: false,
            },
        );
        registry.insert(
            AuthAction::Register,
            LimitLayer::Email,
            LimitPolicy {
                max_attempts: 1,
                window: chrono::Duration::hours(24),
                message:
                    "A registration attempt already exists for this email. Try again in 24 hours."
                        .to_string(),
                clear_on_success: false,
            },
        );
        registry.insert(
            AuthAction::ForgotPassword,
            LimitLayer::Ip,
            LimitPolicy {
                max_attempts: 3,
                window: chrono::Duration::hours(1),
                message: "Too many password recovery attempts from this IP. Try again in 1 hour."
                    .to_string(),
                clear_on_success: false,
            },
        );
        registry.insert(
            AuthAction::ForgotPassword,
            LimitLayer::Email,
            LimitPolicy {
                max_attempts: 2,
                window: chrono::Duration::hours(24),
                message: "Too many recovery attempts for this email. Try again in 24 hours."
                    .to_string(),
                clear_on_success: false,
            },
        );
        registry.insert(
            AuthAction::ResetPassword,
            LimitLayer::Ip,
            LimitPolicy {
                max_attempts: 5,
                window: chrono::Duration::hours(1),
                message: "Too many password reset attempts from this IP. Try again in 1 hour."
                    .to_string(),
                clear_on_success: false,
            },
        );
        registry.insert(
            AuthAction::ResetPassword,
            LimitLayer::Token,
            LimitPolicy {
                max_attempts: 3,
                window: chrono::Duration::hours(1),
                message: "Too many reset attempts with this token. Try again in 1 hour."
                    .to_string(),
                clear_on_success: false,
            },
        );

        registry
    }

    /// Insert or replace the policy for a pair.
    pub fn insert(&mut self, action: AuthAction, layer: LimitLayer, policy: LimitPolicy) {
        self.table.insert((action, layer), policy);
    }

    /// Look up the policy for a pair.
    ///
    /// `None` means the pair is unregulated, not that an error occurred.
    pub fn policy_for(&self, action: AuthAction, layer: LimitLayer) -> Option<&LimitPolicy> {
        self.table.get(&(action, layer))
    }

    /// Number of configured pairs.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_values() {
        let registry = PolicyRegistry::with_defaults();
        assert_eq!(registry.len(), 8);

        let policy = registry.policy_for(AuthAction::Login, LimitLayer::Ip).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.window, chrono::Duration::minutes(15));
        assert!(policy.clear_on_success);

        let policy = registry
            .policy_for(AuthAction::Register, LimitLayer::Email)
            .unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.window, chrono::Duration::hours(24));
        assert!(!policy.clear_on_success);

        let policy = registry
            .policy_for(AuthAction::ResetPassword, LimitLayer::Token)
            .unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.window, chrono::Duration::hours(1));
    }

    #[test]
    fn test_unconfigured_pair_is_unregulated() {
        let registry = PolicyRegistry::with_defaults();

        assert!(registry.policy_for(AuthAction::Login, LimitLayer::Token).is_none());
        assert!(registry
            .policy_for(AuthAction::ResetPassword, LimitLayer::Email)
            .is_none());
    }

    #[test]
    fn test_insert_replaces_policy() {
        let mut registry = PolicyRegistry::with_defaults();
        registry.insert(
            AuthAction::Login,
            LimitLayer::Ip,
            LimitPolicy {
                max_attempts: 100,
                window: chrono::Duration::seconds(1),
                message: "test".to_string(),
                clear_on_success: false,
            },
        );

        let policy = registry.policy_for(AuthAction::Login, LimitLayer::Ip).unwrap();
        assert_eq!(policy.max_attempts, 100);
        assert_eq!(registry.len(), 8);
    }

    #[test]
    fn test_policy_config_conversion() {
        let config = PolicyConfig {
            max_attempts: 7,
            window_secs: 900,
            message: "hold on".to_string(),
            clear_on_success: true,
        };

        let policy: LimitPolicy = config.into();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.window, chrono::Duration::minutes(15));
        assert!(policy.clear_on_success);
    }

    #[test]
    fn test_name_round_trips() {
        for action in [
            AuthAction::Login,
            AuthAction::Register,
            AuthAction::ForgotPassword,
            AuthAction::ResetPassword,
        ] {
            assert_eq!(AuthAction::from_name(action.as_name()), Some(action));
        }
        for layer in [LimitLayer::Ip, LimitLayer::Email, LimitLayer::Token] {
            assert_eq!(LimitLayer::from_name(layer.as_name()), Some(layer));
        }

        assert_eq!(AuthAction::from_name("logout"), None);
        assert_eq!(LimitLayer::from_name("session"), None);
    }
}
