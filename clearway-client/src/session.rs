//! Application session lifecycle: create, submit state, close, query.
//!
//! Each operation kind carries its own busy flag so a second call of the
//! same kind is refused while one is in flight; the flags clear on every
//! exit path. Session state lives in a local cache keyed by session id;
//! the relay stays the source of truth and the cache reconciles on every
//! confirmed response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use clearway_core::{
    equal_weights, Allocation, AppDefinition, AppSession, ClearwayError, ClearwayResult,
    CloseSessionParams, CreateSessionParams, GetLedgerBalancesParams, GetLedgerBalancesReply,
    GetSessionsParams, GetSessionsReply, Method, QuorumPolicy, RequestFrame, SessionKey,
    SessionReply, SessionStatus, SubmitStateParams, PROTOCOL_VERSION,
};

use crate::auth::Authenticator;
use crate::correlator::{method_matcher, session_matcher, Correlator, Matcher};

/// Lifecycle configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Protocol tag stamped into every session definition.
    pub protocol: String,
    /// Asset used for the zero-amount initial allocations.
    pub default_asset: String,
    pub quorum: QuorumPolicy,
    /// Budget for each correlated lifecycle call.
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            default_asset: "usdc".to_string(),
            quorum: QuorumPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Clears a busy flag on every exit path, including cancellation.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &'static str) -> ClearwayResult<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(ClearwayError::Busy(operation));
        }
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Manages application sessions on top of the correlator and the
/// authentication driver.
pub struct SessionManager {
    config: SessionConfig,
    correlator: Arc<Correlator>,
    auth: Arc<Authenticator>,
    session_key: Mutex<Option<Arc<SessionKey>>>,
    sessions: Mutex<HashMap<String, AppSession>>,
    current: Mutex<Option<String>>,
    last_nonce: Mutex<u64>,
    creating: AtomicBool,
    submitting: AtomicBool,
    closing: AtomicBool,
    querying: AtomicBool,
    loading_balances: AtomicBool,
}

impl SessionManager {
    pub fn new(config: SessionConfig, correlator: Arc<Correlator>, auth: Arc<Authenticator>) -> Self {
        Self {
            config,
            correlator,
            auth,
            session_key: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            last_nonce: Mutex::new(0),
            creating: AtomicBool::new(false),
            submitting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            querying: AtomicBool::new(false),
            loading_balances: AtomicBool::new(false),
        }
    }

    pub fn set_session_key(&self, key: Arc<SessionKey>) {
        *self.session_key.lock() = Some(key);
    }

    /// Create a session with the local wallet plus `counterparties`.
    /// The confirmed session becomes the current one.
    pub async fn create_session(
        &self,
        counterparties: &[String],
        category: &str,
    ) -> ClearwayResult<AppSession> {
        let _busy = BusyGuard::acquire(&self.creating, "create_session")?;
        let (session_key, wallet_address) = self.require_authenticated()?;

        let mut participants = vec![wallet_address.clone()];
        participants.extend(
            counterparties
                .iter()
                .filter(|p| **p != wallet_address)
                .cloned(),
        );

        let definition = AppDefinition {
            protocol: self.config.protocol.clone(),
            participants: participants.clone(),
            weights: equal_weights(participants.len()),
            quorum: self.config.quorum.threshold(participants.len()),
            challenge: 0,
            nonce: self.next_nonce(),
        };
        let allocations: Vec<Allocation> = participants
            .iter()
            .map(|participant| Allocation {
                participant: participant.clone(),
                asset: self.config.default_asset.clone(),
                amount: "0".to_string(),
            })
            .collect();

        // Locally pending until the relay confirms an id.
        let mut session = AppSession::pending(&definition, allocations.clone());

        let params = CreateSessionParams {
            definition,
            allocations,
        };
        let frame = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::CreateAppSession,
            serde_json::to_value(&params)?,
        )
        .signed(session_key.as_ref())?;

        tracing::debug!(
            category,
            participants = session.participants.len(),
            "creating app session"
        );

        let reply = self
            .correlator
            .correlate(
                frame,
                method_matcher(Method::CreateAppSession),
                self.config.request_timeout,
            )
            .await?;
        let reply: SessionReply = reply.params_as()?;

        session.app_session_id = reply.app_session_id.clone();
        session.status = SessionStatus::Active;

        self.sessions
            .lock()
            .insert(reply.app_session_id.clone(), session.clone());
        *self.current.lock() = Some(reply.app_session_id.clone());
        tracing::info!(session = %reply.app_session_id, category, "app session active");
        Ok(session)
    }

    /// Submit an application state update into an active session. The
    /// data is serialized to a JSON string for transport.
    pub async fn submit_state<T: Serialize>(
        &self,
        session_id: &str,
        application_data: &T,
        allocations: Option<Vec<Allocation>>,
    ) -> ClearwayResult<()> {
        let _busy = BusyGuard::acquire(&self.submitting, "submit_state")?;
        let (session_key, _) = self.require_authenticated()?;
        self.require_active(session_id)?;

        let session_data = serde_json::to_string(application_data)?;
        let params = SubmitStateParams {
            app_session_id: session_id.to_string(),
            session_data: session_data.clone(),
            allocations: allocations.unwrap_or_default(),
        };
        let frame = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::SubmitAppState,
            serde_json::to_value(&params)?,
        )
        .signed(session_key.as_ref())?;

        self.correlator
            .correlate(
                frame,
                session_matcher(Method::SubmitAppState, session_id),
                self.config.request_timeout,
            )
            .await?;

        if let Some(entry) = self.sessions.lock().get_mut(session_id) {
            entry.last_session_data = Some(session_data);
        }
        tracing::debug!(session = %session_id, "state submitted");
        Ok(())
    }

    /// Close an active session with its final allocations. On success the
    /// cached record becomes closed and, if it was current, the current
    /// pointer clears.
    pub async fn close_session(
        &self,
        session_id: &str,
        final_allocations: Vec<Allocation>,
    ) -> ClearwayResult<()> {
        let _busy = BusyGuard::acquire(&self.closing, "close_session")?;
        let (session_key, _) = self.require_authenticated()?;
        self.require_active(session_id)?;

        let params = CloseSessionParams {
            app_session_id: session_id.to_string(),
            allocations: final_allocations,
        };
        let frame = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::CloseAppSession,
            serde_json::to_value(&params)?,
        )
        .signed(session_key.as_ref())?;

        self.correlator
            .correlate(
                frame,
                session_matcher(Method::CloseAppSession, session_id),
                self.config.request_timeout,
            )
            .await?;

        if let Some(entry) = self.sessions.lock().get_mut(session_id) {
            entry.status = SessionStatus::Closed;
        }
        {
            let mut current = self.current.lock();
            if current.as_deref() == Some(session_id) {
                *current = None;
            }
        }
        tracing::info!(session = %session_id, "app session closed");
        Ok(())
    }

    /// Fetch the sessions visible to `participant` (default: self) and
    /// reconcile the local cache with the relay's records.
    pub async fn query_sessions(
        &self,
        participant: Option<&str>,
    ) -> ClearwayResult<Vec<AppSession>> {
        let _busy = BusyGuard::acquire(&self.querying, "query_sessions")?;
        let (session_key, wallet_address) = self.require_authenticated()?;

        let params = GetSessionsParams {
            participant: participant.unwrap_or(&wallet_address).to_string(),
        };
        let frame = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::GetAppSessions,
            serde_json::to_value(&params)?,
        )
        .signed(session_key.as_ref())?;

        let matcher: Matcher = Box::new(|message| {
            message.method == Method::GetAppSessions
                && message.params.get("app_sessions").is_some()
        });
        let reply = self
            .correlator
            .correlate(frame, matcher, self.config.request_timeout)
            .await?;
        let reply: GetSessionsReply = reply.params_as()?;

        let sessions: Vec<AppSession> = reply
            .app_sessions
            .into_iter()
            .map(AppSession::from_record)
            .collect();
        {
            let mut cache = self.sessions.lock();
            for session in &sessions {
                cache.insert(session.app_session_id.clone(), session.clone());
            }
        }
        tracing::debug!(count = sessions.len(), "sessions retrieved");
        Ok(sessions)
    }

    /// Fetch the relay-side ledger balances for `account` (default: self).
    pub async fn ledger_balances(
        &self,
        account: Option<&str>,
    ) -> ClearwayResult<HashMap<String, String>> {
        let _busy = BusyGuard::acquire(&self.loading_balances, "get_ledger_balances")?;
        let (session_key, wallet_address) = self.require_authenticated()?;

        let params = GetLedgerBalancesParams {
            participant: account.unwrap_or(&wallet_address).to_string(),
        };
        let frame = RequestFrame::new(
            self.correlator.next_request_id(),
            Method::GetLedgerBalances,
            serde_json::to_value(&params)?,
        )
        .signed(session_key.as_ref())?;

        let reply = self
            .correlator
            .correlate(
                frame,
                method_matcher(Method::GetLedgerBalances),
                self.config.request_timeout,
            )
            .await?;
        let reply: GetLedgerBalancesReply = reply.params_as()?;

        Ok(reply
            .ledger_balances
            .into_iter()
            .map(|balance| (balance.asset, balance.amount))
            .collect())
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current.lock().clone()
    }

    pub fn set_current_session_id(&self, id: Option<String>) {
        *self.current.lock() = id;
    }

    /// Cached copy of a session, if known locally.
    pub fn session(&self, session_id: &str) -> Option<AppSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn is_creating(&self) -> bool {
        self.creating.load(Ordering::SeqCst)
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn is_querying(&self) -> bool {
        self.querying.load(Ordering::SeqCst)
    }

    fn require_authenticated(&self) -> ClearwayResult<(Arc<SessionKey>, String)> {
        if !self.auth.is_authenticated() {
            return Err(ClearwayError::NotAuthenticated);
        }
        let session_key = self
            .session_key
            .lock()
            .clone()
            .ok_or(ClearwayError::NotAuthenticated)?;
        let wallet_address = self
            .auth
            .wallet_address()
            .ok_or(ClearwayError::NotAuthenticated)?;
        Ok((session_key, wallet_address))
    }

    fn require_active(&self, session_id: &str) -> ClearwayResult<()> {
        match self.sessions.lock().get(session_id) {
            Some(session) if session.status == SessionStatus::Active => Ok(()),
            _ => Err(ClearwayError::NoActiveSession),
        }
    }

    /// Monotonic nonce for session definitions, clock-based but never
    /// repeating within a client.
    fn next_nonce(&self) -> u64 {
        let mut last = self.last_nonce.lock();
        let now = Utc::now().timestamp_millis().max(0) as u64;
        *last = now.max(*last + 1);
        *last
    }
}
