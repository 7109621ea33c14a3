//! The policy gate in front of every privileged call.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{AuthDecision, DenialReason, PolicyError, Session};

/// Enforces the privileged-access policy.
///
/// Fails closed: a missing, revoked, expired, untrusted or non-privileged
/// session is denied. The gate holds no session state of its own apart from
/// the set of revoked tokens; sessions are passed explicitly on every call.
#[derive(Debug, Default)]
pub struct SessionGate {
    revoked: RwLock<HashSet<String>>,
}

impl SessionGate {
    /// Create a gate with no revoked tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Revoke a token. Later checks for sessions carrying it are denied.
    pub fn revoke(&self, token: &str) {
        self.revoked.write().insert(token.to_string());
    }

    /// Decide whether a privileged call may proceed now.
    pub fn authorize(&self, session: Option<&Session>) -> AuthDecision {
        self.authorize_at(session, Utc::now())
    }

    /// Decide whether a privileged call may proceed at `now`.
    ///
    /// Checks in order: revoked, expired, untrusted, not privileged.
    pub fn authorize_at(&self, session: Option<&Session>, now: DateTime<Utc>) -> AuthDecision {
        let Some(session) = session else {
            return AuthDecision::Denied(DenialReason::Untrusted);
        };

        if let Some(reason) = self.validity_denial(session, now) {
            return AuthDecision::Denied(reason);
        }
        if !session.privileged_access_allowed {
            return AuthDecision::Denied(DenialReason::NotPrivileged);
        }
        AuthDecision::Allowed
    }

    fn validity_denial(&self, session: &Session, now: DateTime<Utc>) -> Option<DenialReason> {
        if session.token.is_empty() || self.revoked.read().contains(&session.token) {
            return Some(DenialReason::Revoked);
        }
        if session.is_expired_at(now) {
            return Some(DenialReason::Expired);
        }
        if !session.trusted {
            return Some(DenialReason::Untrusted);
        }
        None
    }

    /// Guard for ordinary (non-privileged) calls: the session must be
    /// unrevoked, unexpired and trusted.
    pub fn require_session(&self, session: &Session) -> Result<(), PolicyError> {
        self.require_session_at(session, Utc::now())
    }

    /// [`require_session`](Self::require_session) evaluated at `now`.
    pub fn require_session_at(&self, session: &Session, now: DateTime<Utc>) -> Result<(), PolicyError> {
        match self.validity_denial(session, now) {
            None => Ok(()),
            Some(reason) => {
                warn!(account = %session.account_id, reason = %reason, "Session rejected");
                Err(PolicyError::Denied { reason })
            }
        }
    }

    /// Guard for calls touching privileged-origin data.
    ///
    /// Every denial is logged with its reason and returned unchanged.
    pub fn require_privileged(&self, session: &Session) -> Result<(), PolicyError> {
        self.require_privileged_at(session, Utc::now())
    }

    /// [`require_privileged`](Self::require_privileged) evaluated at `now`.
    pub fn require_privileged_at(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<(), PolicyError> {
        match self.authorize_at(Some(session), now) {
            AuthDecision::Allowed => {
                debug!(account = %session.account_id, "Privileged access allowed");
                Ok(())
            }
            AuthDecision::Denied(reason) => {
                warn!(
                    account = %session.account_id,
                    reason = %reason,
                    "Privileged access denied by policy gate"
                );
                Err(PolicyError::Denied { reason })
            }
        }
    }

    /// Human-readable capability lines for a session.
    pub fn describe_capabilities(&self, session: &Session) -> Vec<String> {
        let mut lines = Vec::new();
        match self.authorize(Some(session)) {
            AuthDecision::Allowed => {
                lines.push("Privileged device backup inspection is ENABLED.".to_string());
            }
            AuthDecision::Denied(reason) => {
                lines.push(format!(
                    "Privileged device backup inspection is DISABLED ({}).",
                    reason
                ));
            }
        }
        lines.push("Locally verifiable backups can be listed and transferred.".to_string());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn privileged_session() -> Session {
        let mut session = Session::new("alice", "tok", true, Utc::now() + Duration::hours(1));
        session.privileged_access_allowed = true;
        session
    }

    #[test]
    fn test_allows_valid_privileged_session() {
        let gate = SessionGate::new();
        assert_eq!(
            gate.authorize(Some(&privileged_session())),
            AuthDecision::Allowed
        );
    }

    #[test]
    fn test_missing_session_is_denied() {
        let gate = SessionGate::new();
        assert_eq!(
            gate.authorize(None),
            AuthDecision::Denied(DenialReason::Untrusted)
        );
    }

    #[test]
    fn test_expired_session_is_denied() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::Expired)
        );
    }

    #[test]
    fn test_untrusted_session_is_denied() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.trusted = false;
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::Untrusted)
        );
    }

    #[test]
    fn test_non_privileged_session_is_denied() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.privileged_access_allowed = false;
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::NotPrivileged)
        );
    }

    #[test]
    fn test_revoked_token_is_denied() {
        let gate = SessionGate::new();
        let session = privileged_session();
        gate.revoke(&session.token);
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::Revoked)
        );
    }

    #[test]
    fn test_empty_token_is_revoked() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.token.clear();
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::Revoked)
        );
    }

    #[test]
    fn test_revoked_wins_over_expired() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.expires_at = Utc::now() - Duration::hours(1);
        gate.revoke(&session.token);
        assert_eq!(
            gate.authorize(Some(&session)),
            AuthDecision::Denied(DenialReason::Revoked)
        );
    }

    #[test]
    fn test_require_privileged_surfaces_reason() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.privileged_access_allowed = false;

        let err = gate.require_privileged(&session).unwrap_err();
        assert_eq!(err.reason(), DenialReason::NotPrivileged);
        assert!(gate.require_privileged(&privileged_session()).is_ok());
    }

    #[test]
    fn test_require_session_ignores_privilege() {
        let gate = SessionGate::new();
        let mut session = privileged_session();
        session.privileged_access_allowed = false;
        assert!(gate.require_session(&session).is_ok());

        session.expires_at = Utc::now() - Duration::seconds(1);
        let err = gate.require_session(&session).unwrap_err();
        assert_eq!(err.reason(), DenialReason::Expired);
    }

    #[test]
    fn test_describe_capabilities() {
        let gate = SessionGate::new();
        let lines = gate.describe_capabilities(&privileged_session());
        assert!(lines[0].contains("ENABLED"));

        let mut session = privileged_session();
        session.privileged_access_allowed = false;
        let lines = gate.describe_capabilities(&session);
        assert!(lines[0].contains("DISABLED"));
    }
}
