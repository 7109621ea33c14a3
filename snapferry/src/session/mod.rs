//! Session validity and the privileged-access policy gate.
//!
//! Sessions are produced by an external authentication collaborator (login
//! plus second factor) and consumed read-only here. The [`SessionGate`]
//! decides whether a privileged call may proceed; [`AuthFlow`] tracks the
//! login state machine including the explicit privileged opt-in.
//!
//! # State Machine
//!
//! ```text
//! Unauthenticated --begin_login--> PendingSecondFactor
//! PendingSecondFactor --complete_second_factor--> Authenticated{privileged: false}
//! Authenticated{false} --opt_in_privileged--> Authenticated{privileged: true}
//! Authenticated{*} --session expiry--> Unauthenticated
//! ```

mod flow;
mod gate;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use flow::{AuthFlow, AuthState, FlowError, PrivilegeOptIn};
pub use gate::SessionGate;

/// An authenticated session handed over by the auth collaborator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Account the session belongs to.
    pub account_id: String,
    /// Opaque session token. Never logged.
    pub token: String,
    /// Whether the second factor marked this session as trusted.
    pub trusted: bool,
    /// Instant after which the token is no longer valid.
    pub expires_at: DateTime<Utc>,
    /// Whether the user explicitly opted in to privileged access.
    #[serde(default)]
    pub privileged_access_allowed: bool,
}

impl Session {
    /// Create a non-privileged session.
    pub fn new(
        account_id: impl Into<String>,
        token: impl Into<String>,
        trusted: bool,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            token: token.into(),
            trusted,
            expires_at,
            privileged_access_allowed: false,
        }
    }

    /// Check whether the session has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Load a session from a JSON file written by the auth collaborator.
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .field("trusted", &self.trusted)
            .field("expires_at", &self.expires_at)
            .field("privileged_access_allowed", &self.privileged_access_allowed)
            .finish()
    }
}

/// Why a privileged call was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The session token has expired.
    Expired,
    /// The user has not opted in to privileged access for this session.
    NotPrivileged,
    /// The session is missing or was not marked trusted by the second factor.
    Untrusted,
    /// The session token has been revoked.
    Revoked,
}

impl DenialReason {
    /// Guidance a renderer can show alongside the reason.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Expired => "the session has expired; sign in again",
            Self::NotPrivileged => {
                "privileged backup access is disabled for this session; \
                 re-run with --allow-privileged to opt in"
            }
            Self::Untrusted => "the session is not trusted; complete two-factor sign-in",
            Self::Revoked => "the session was revoked; sign in again",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Expired => "expired",
            Self::NotPrivileged => "not privileged",
            Self::Untrusted => "untrusted",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The privileged call may proceed.
    Allowed,
    /// The call must not proceed.
    Denied(DenialReason),
}

impl AuthDecision {
    /// Check whether the decision allows the call.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// A session or authorization denial.
///
/// Never retried automatically; callers surface the reason verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The policy gate denied the call.
    #[error("access denied: {reason} ({})", .reason.guidance())]
    Denied { reason: DenialReason },
}

impl PolicyError {
    /// The denial reason.
    pub fn reason(&self) -> DenialReason {
        match self {
            Self::Denied { reason } => *reason,
        }
    }
}
