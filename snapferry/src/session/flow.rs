//! Login state machine with an explicit privileged opt-in.

use chrono::{DateTime, Utc};
use tracing::info;

use super::Session;

/// Where a login attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No login in progress.
    Unauthenticated,
    /// Credentials accepted; waiting for the second factor.
    PendingSecondFactor,
    /// Fully signed in.
    Authenticated {
        /// Whether the user opted in to privileged access.
        privileged: bool,
    },
}

/// Explicit user acknowledgement required to enable privileged access.
///
/// Distinct from basic login so that an opt-in can never happen as a side
/// effect of signing in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeOptIn {
    /// Free-form acknowledgement text, recorded in the log.
    pub acknowledgement: String,
}

impl PrivilegeOptIn {
    /// Create an opt-in with the given acknowledgement.
    pub fn new(acknowledgement: impl Into<String>) -> Self {
        Self {
            acknowledgement: acknowledgement.into(),
        }
    }
}

/// Invalid transition of the login state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: AuthState,
    },

    #[error("second factor produced a session that is already expired")]
    ExpiredSession,

    #[error("privileged opt-in requires a non-empty acknowledgement")]
    EmptyAcknowledgement,
}

/// Tracks one login from credentials to an (optionally privileged) session.
///
/// Downgrading from privileged happens only through session expiry.
#[derive(Debug)]
pub struct AuthFlow {
    state: AuthState,
    session: Option<Session>,
}

impl Default for AuthFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthFlow {
    /// Start in `Unauthenticated`.
    pub fn new() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            session: None,
        }
    }

    /// Credentials accepted; a second factor is now required.
    pub fn begin_login(&mut self) -> Result<AuthState, FlowError> {
        self.expire_if_needed(Utc::now());
        match self.state {
            AuthState::Unauthenticated => {
                self.state = AuthState::PendingSecondFactor;
                Ok(self.state)
            }
            state => Err(FlowError::InvalidTransition {
                action: "begin login",
                state,
            }),
        }
    }

    /// Second factor accepted; take ownership of the resulting session.
    ///
    /// The session always starts non-privileged regardless of what the
    /// collaborator set.
    pub fn complete_second_factor(&mut self, mut session: Session) -> Result<AuthState, FlowError> {
        if self.state != AuthState::PendingSecondFactor {
            return Err(FlowError::InvalidTransition {
                action: "complete second factor",
                state: self.state,
            });
        }
        if session.is_expired_at(Utc::now()) {
            return Err(FlowError::ExpiredSession);
        }

        session.privileged_access_allowed = false;
        info!(
            account = %session.account_id,
            trusted = session.trusted,
            "Second factor completed"
        );
        self.session = Some(session);
        self.state = AuthState::Authenticated { privileged: false };
        Ok(self.state)
    }

    /// Upgrade the current session to privileged access.
    ///
    /// One way per session. Opting in again is a no-op.
    pub fn opt_in_privileged(&mut self, opt_in: PrivilegeOptIn) -> Result<AuthState, FlowError> {
        self.expire_if_needed(Utc::now());
        if opt_in.acknowledgement.trim().is_empty() {
            return Err(FlowError::EmptyAcknowledgement);
        }

        match (self.state, self.session.as_mut()) {
            (AuthState::Authenticated { .. }, Some(session)) => {
                if !session.privileged_access_allowed {
                    session.privileged_access_allowed = true;
                    info!(
                        account = %session.account_id,
                        acknowledgement = %opt_in.acknowledgement,
                        "User opted in to privileged backup access"
                    );
                }
                self.state = AuthState::Authenticated { privileged: true };
                Ok(self.state)
            }
            (state, _) => Err(FlowError::InvalidTransition {
                action: "opt in to privileged access",
                state,
            }),
        }
    }

    /// Current state evaluated at `now`.
    ///
    /// An expired session reports `Unauthenticated`.
    pub fn state_at(&mut self, now: DateTime<Utc>) -> AuthState {
        self.expire_if_needed(now);
        self.state
    }

    /// Current state evaluated now.
    pub fn state(&mut self) -> AuthState {
        self.state_at(Utc::now())
    }

    /// The session, if authenticated and not expired.
    pub fn session(&mut self) -> Option<&Session> {
        self.expire_if_needed(Utc::now());
        self.session.as_ref()
    }

    fn expire_if_needed(&mut self, now: DateTime<Utc>) {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|session| session.is_expired_at(now));
        if expired {
            if let Some(session) = self.session.take() {
                info!(account = %session.account_id, "Session expired");
            }
            self.state = AuthState::Unauthenticated;
        }
    }
}
