//! Authentication handshake driver.
//!
//! Binds the wallet identity to the ephemeral session key through a
//! challenge/verify exchange with the relay. The trigger is
//! level-triggered: `maybe_authenticate` re-evaluates its precondition
//! whenever a constituent fact changes, and fires at most once per
//! session-key/wallet pairing until a failure re-arms the guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use clearway_core::{
    AuthChallengeParams, AuthContext, AuthEvent, AuthState, AuthVerifyParams, AuthVerifyReply,
    ClearwayError, ClearwayResult, Method, RequestFrame, SessionKey, Signer,
};

use crate::correlator::{method_matcher, Correlator};
use crate::keystore::Keystore;
use crate::transport::ConnectionState;

/// Handshake configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub app_name: String,
    pub scope: String,
    /// Lifetime of the wallet/session-key binding, in seconds.
    pub session_duration_secs: u64,
    /// Budget for each of the two handshake round trips.
    pub request_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_name: "clearway".to_string(),
            scope: "clearway.app".to_string(),
            session_duration_secs: 3600,
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Flow {
    state: AuthState,
    attempted: bool,
    wallet: Option<Arc<dyn Signer>>,
    session_key: Option<Arc<SessionKey>>,
}

/// Drives the [`AuthState`] automaton over the correlator.
pub struct Authenticator {
    config: AuthConfig,
    correlator: Arc<Correlator>,
    keystore: Arc<Keystore>,
    flow: Mutex<Flow>,
}

impl Authenticator {
    pub fn new(config: AuthConfig, correlator: Arc<Correlator>, keystore: Arc<Keystore>) -> Self {
        Self {
            config,
            correlator,
            keystore,
            flow: Mutex::new(Flow {
                state: AuthState::Idle,
                attempted: false,
                wallet: None,
                session_key: None,
            }),
        }
    }

    pub fn state(&self) -> AuthState {
        self.flow.lock().state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn wallet_address(&self) -> Option<String> {
        self.flow
            .lock()
            .wallet
            .as_ref()
            .map(|w| w.address().to_string())
    }

    /// Install the wallet signer. A new pairing re-arms the guard.
    pub fn set_wallet(&self, wallet: Arc<dyn Signer>) {
        let mut flow = self.flow.lock();
        flow.wallet = Some(wallet);
        flow.attempted = false;
    }

    /// Install the session key. A new pairing re-arms the guard.
    pub fn set_session_key(&self, session_key: Arc<SessionKey>) {
        let mut flow = self.flow.lock();
        flow.session_key = Some(session_key);
        flow.attempted = false;
    }

    /// Drop all handshake state, e.g. on explicit disconnect.
    pub fn reset(&self) {
        let mut flow = self.flow.lock();
        tracing::debug!("auth state: {:?} -> idle (reset)", flow.state);
        flow.state = AuthState::Idle;
        flow.attempted = false;
    }

    /// Evaluate the handshake precondition and run the exchange if it
    /// holds: wallet present, session key present, transport connected,
    /// not yet authenticated, not yet attempted. Returns `Ok(false)` when
    /// the condition does not hold; callers invoke this freely on every
    /// fact change.
    pub async fn maybe_authenticate(&self) -> ClearwayResult<bool> {
        let (wallet, session_key) = {
            let mut flow = self.flow.lock();
            let connected = self.correlator.transport().state() == ConnectionState::Connected;
            let startable = matches!(flow.state, AuthState::Idle | AuthState::Failed);
            let ready = connected
                && startable
                && !flow.attempted
                && flow.wallet.is_some()
                && flow.session_key.is_some();
            if !ready {
                return Ok(false);
            }
            flow.attempted = true;
            if flow.state == AuthState::Failed {
                tracing::debug!("auth state: failed -> idle (retry)");
                flow.state = AuthState::Idle;
            }
            (
                Arc::clone(flow.wallet.as_ref().expect("checked above")),
                Arc::clone(flow.session_key.as_ref().expect("checked above")),
            )
        };

        match self.handshake(wallet, session_key).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        wallet: Arc<dyn Signer>,
        session_key: Arc<SessionKey>,
    ) -> ClearwayResult<()> {
        let expire = Utc::now().timestamp().max(0) as u64 + self.config.session_duration_secs;
        let context = AuthContext {
            wallet_address: wallet.address().to_string(),
            session_key_address: session_key.address().to_string(),
            app_name: self.config.app_name.clone(),
            scope: self.config.scope.clone(),
            expire_timestamp: expire,
            allowances: Vec::new(),
            bearer_token: self.keystore.load_bearer_token(),
        };

        let request = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::AuthRequest,
            serde_json::to_value(&context)?,
        )
        .signed(session_key.as_ref())?;

        self.apply(AuthEvent::ChallengeSent)?;
        let challenge_message = self
            .correlator
            .correlate(
                request,
                method_matcher(Method::AuthChallenge),
                self.config.request_timeout,
            )
            .await?;
        self.apply(AuthEvent::ChallengeReceived)?;

        let challenge: AuthChallengeParams = challenge_message.params_as()?;
        let binding = context.binding_bytes(&challenge.challenge_message)?;
        let signature = wallet
            .sign(&binding)
            .map_err(|_| ClearwayError::SignatureRejected)?;

        let verify = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::AuthVerify,
            serde_json::to_value(&AuthVerifyParams {
                challenge: challenge.challenge_message,
                signature,
            })?,
        )
        .signed(session_key.as_ref())?;

        self.apply(AuthEvent::VerifySent)?;
        let reply = self
            .correlator
            .correlate(
                verify,
                method_matcher(Method::AuthVerify),
                self.config.request_timeout,
            )
            .await?;

        let reply: AuthVerifyReply = reply.params_as()?;
        if !reply.success {
            return Err(ClearwayError::Relay("authentication refused".to_string()));
        }
        if let Some(token) = reply.bearer_token.as_deref() {
            if let Err(e) = self.keystore.store_bearer_token(token) {
                tracing::warn!("failed to persist bearer token: {}", e);
            }
        }
        self.apply(AuthEvent::VerifySucceeded)?;
        tracing::info!(wallet = %wallet.address(), session_key = %session_key.address(), "authenticated");
        Ok(())
    }

    fn apply(&self, event: AuthEvent) -> ClearwayResult<()> {
        let mut flow = self.flow.lock();
        let next = match (&flow.state, &event) {
            (AuthState::Idle, AuthEvent::ChallengeSent) => AuthState::ChallengeRequested,
            (AuthState::ChallengeRequested, AuthEvent::ChallengeReceived) => {
                AuthState::ChallengeReceived
            }
            (AuthState::ChallengeReceived, AuthEvent::VerifySent) => AuthState::VerifySent,
            (AuthState::VerifySent, AuthEvent::VerifySucceeded) => AuthState::Authenticated,
            (state, event) => {
                return Err(ClearwayError::Protocol(format!(
                    "invalid auth transition from {:?} on {:?}",
                    state, event
                )));
            }
        };

        if flow.state.can_transition_to(next) {
            tracing::debug!("auth state: {:?} -> {:?}", flow.state, next);
            flow.state = next;
            Ok(())
        } else {
            Err(ClearwayError::Protocol(format!(
                "invalid auth transition: {:?} -> {:?}",
                flow.state, next
            )))
        }
    }

    /// Failure re-arms the guard so the level-triggered condition can
    /// fire again.
    fn fail(&self, error: &ClearwayError) {
        tracing::warn!("authentication failed: {}", error);
        let mut flow = self.flow.lock();
        if flow.state.can_transition_to(AuthState::Failed) {
            tracing::debug!("auth state: {:?} -> failed", flow.state);
            flow.state = AuthState::Failed;
        }
        flow.attempted = false;
    }
}
