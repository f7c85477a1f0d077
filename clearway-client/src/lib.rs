//! Clearway client: off-chain application-session coordination through a
//! relay.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use clearway_client::{ClearwayClient, ClearwayConfig};
//! use clearway_core::WalletKey;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClearwayConfig::new("wss://relay.example/ws", ".clearway");
//!     let client = ClearwayClient::new(config)?;
//!     client.connect();
//!
//!     client.set_wallet(Arc::new(WalletKey::generate())).await?;
//!
//!     let session = client.create_session(&["0xb00b...".into()], "demo").await?;
//!     client.submit_state(&session.app_session_id, &serde_json::json!({"n": 1}), None).await?;
//!     Ok(())
//! }
//! ```

mod auth;
mod correlator;
mod keystore;
mod session;
mod transport;

#[cfg(test)]
mod testutil;

pub use auth::{AuthConfig, Authenticator};
pub use correlator::{method_matcher, session_matcher, Correlator, Matcher};
pub use keystore::Keystore;
pub use session::{SessionConfig, SessionManager};
pub use transport::{ConnectionState, ListenerId, Transport};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clearway_core::{
    Allocation, AppSession, AuthState, BalanceUpdateParams, ClearwayResult, LedgerBalance, Method,
    SessionKey, Signer,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClearwayConfig {
    /// WebSocket URL of the relay.
    pub relay_url: String,
    /// Directory for the persisted session key and bearer token.
    pub keystore_dir: PathBuf,
    pub auth: AuthConfig,
    pub session: SessionConfig,
}

impl ClearwayConfig {
    pub fn new(relay_url: impl Into<String>, keystore_dir: impl Into<PathBuf>) -> Self {
        Self {
            relay_url: relay_url.into(),
            keystore_dir: keystore_dir.into(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// High-level Clearway client: transport, correlation, authentication and
/// session lifecycle wired together.
pub struct ClearwayClient {
    transport: Transport,
    authenticator: Arc<Authenticator>,
    sessions: SessionManager,
    keystore: Arc<Keystore>,
}

impl ClearwayClient {
    /// Build a client. Loads (or generates) the persisted session key; no
    /// network activity until [`connect`](Self::connect).
    pub fn new(config: ClearwayConfig) -> ClearwayResult<Self> {
        let keystore = Arc::new(Keystore::new(config.keystore_dir));
        let session_key = Arc::new(keystore.load_or_generate_session_key()?);

        let transport = Transport::new(config.relay_url);
        let correlator = Arc::new(Correlator::new(transport.clone()));
        let authenticator = Arc::new(Authenticator::new(
            config.auth,
            Arc::clone(&correlator),
            Arc::clone(&keystore),
        ));
        authenticator.set_session_key(Arc::clone(&session_key));

        let sessions = SessionManager::new(config.session, correlator, Arc::clone(&authenticator));
        sessions.set_session_key(session_key);

        // Re-evaluate the handshake precondition on every connect; a drop
        // invalidates the relay-side session, so the machine re-arms and
        // the next connect re-authenticates (offering any persisted
        // bearer token).
        let auth_hook = Arc::clone(&authenticator);
        transport.add_status_listener(move |status| match status {
            ConnectionState::Connected => {
                let auth = Arc::clone(&auth_hook);
                tokio::spawn(async move {
                    if let Err(e) = auth.maybe_authenticate().await {
                        tracing::warn!("authentication attempt failed: {}", e);
                    }
                });
            }
            ConnectionState::Disconnected => auth_hook.reset(),
            ConnectionState::Connecting => {}
        });

        Ok(Self {
            transport,
            authenticator,
            sessions,
            keystore,
        })
    }

    /// Open the relay channel. Idempotent.
    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Install the wallet signer and re-evaluate the handshake
    /// precondition. Returns whether a handshake ran.
    pub async fn set_wallet(&self, wallet: Arc<dyn Signer>) -> ClearwayResult<bool> {
        self.authenticator.set_wallet(wallet);
        self.authenticator.maybe_authenticate().await
    }

    /// Explicitly re-evaluate the handshake precondition.
    pub async fn authenticate(&self) -> ClearwayResult<bool> {
        self.authenticator.maybe_authenticate().await
    }

    pub fn auth_state(&self) -> AuthState {
        self.authenticator.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticator.is_authenticated()
    }

    pub async fn create_session(
        &self,
        counterparties: &[String],
        category: &str,
    ) -> ClearwayResult<AppSession> {
        self.sessions.create_session(counterparties, category).await
    }

    pub async fn submit_state<T: serde::Serialize>(
        &self,
        session_id: &str,
        application_data: &T,
        allocations: Option<Vec<Allocation>>,
    ) -> ClearwayResult<()> {
        self.sessions
            .submit_state(session_id, application_data, allocations)
            .await
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        final_allocations: Vec<Allocation>,
    ) -> ClearwayResult<()> {
        self.sessions
            .close_session(session_id, final_allocations)
            .await
    }

    pub async fn query_sessions(
        &self,
        participant: Option<&str>,
    ) -> ClearwayResult<Vec<AppSession>> {
        self.sessions.query_sessions(participant).await
    }

    pub async fn ledger_balances(
        &self,
        account: Option<&str>,
    ) -> ClearwayResult<HashMap<String, String>> {
        self.sessions.ledger_balances(account).await
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.sessions.current_session_id()
    }

    /// Cached copy of a session, if known locally.
    pub fn session(&self, session_id: &str) -> Option<AppSession> {
        self.sessions.session(session_id)
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    /// Observe unsolicited balance-update pushes from the relay.
    pub fn on_balance_update(
        &self,
        listener: impl Fn(&[LedgerBalance]) + Send + Sync + 'static,
    ) -> ListenerId {
        self.transport.add_message_listener(move |message| {
            if message.method == Method::BalanceUpdate {
                match message.params_as::<BalanceUpdateParams>() {
                    Ok(params) => listener(&params.balance_updates),
                    Err(e) => tracing::warn!("unreadable balance update: {}", e),
                }
            }
        })
    }

    pub fn remove_balance_listener(&self, id: ListenerId) -> bool {
        self.transport.remove_message_listener(id)
    }

    /// Tear down: close the channel, destroy persisted key material, and
    /// install a fresh session key so the next handshake starts clean.
    pub fn disconnect(&self) -> ClearwayResult<()> {
        self.transport.close();
        self.keystore.clear()?;

        let fresh = Arc::new(SessionKey::generate());
        self.keystore.store_session_key(&fresh)?;
        self.authenticator.reset();
        self.authenticator.set_session_key(Arc::clone(&fresh));
        self.sessions.set_session_key(fresh);
        tracing::info!("disconnected; session key rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{lifecycle_script, reply, temp_dir, wait_for_state, MockRelay};
    use clearway_core::WalletKey;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    async fn client_for(relay: &MockRelay, label: &str) -> ClearwayClient {
        let mut config = ClearwayConfig::new(relay.url(), temp_dir(label));
        config.auth.request_timeout = Duration::from_secs(2);
        config.session.request_timeout = Duration::from_secs(2);
        ClearwayClient::new(config).expect("client")
    }

    #[tokio::test]
    async fn full_lifecycle_against_scripted_relay() {
        let relay = MockRelay::spawn(lifecycle_script).await;
        let client = client_for(&relay, "facade").await;

        client.connect();
        wait_for_state(client.transport(), ConnectionState::Connected).await;

        assert!(client.set_wallet(Arc::new(WalletKey::generate())).await.unwrap());
        assert!(client.is_authenticated());

        let session = client
            .create_session(&["0xb".to_string()], "demo")
            .await
            .unwrap();
        assert_eq!(session.app_session_id, "0xs1");
        assert_eq!(client.current_session_id().as_deref(), Some("0xs1"));

        client
            .submit_state("0xs1", &serde_json::json!({"round": 1}), None)
            .await
            .unwrap();

        client.close_session("0xs1", Vec::new()).await.unwrap();
        assert_eq!(client.current_session_id(), None);

        let sessions = client.query_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn connect_triggers_authentication_when_wallet_present() {
        let relay = MockRelay::spawn(lifecycle_script).await;
        let client = client_for(&relay, "autoauth").await;

        // Wallet installed while disconnected: nothing to do yet.
        assert!(!client.set_wallet(Arc::new(WalletKey::generate())).await.unwrap());
        assert!(!client.is_authenticated());

        // The status listener re-evaluates the level condition on connect.
        client.connect();
        wait_for_state(client.transport(), ConnectionState::Connected).await;
        for _ in 0..200 {
            if client.is_authenticated() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_authenticated());
        assert_eq!(relay.requests_of(Method::AuthRequest), 1);
    }

    #[tokio::test]
    async fn balance_pushes_reach_registered_listener() {
        let relay = MockRelay::spawn(|message| match message.method {
            Method::GetAppSessions => vec![
                reply(
                    0,
                    Method::BalanceUpdate,
                    serde_json::json!({"balance_updates": [
                        {"asset": "usdc", "amount": "42"},
                    ]}),
                ),
                reply(
                    message.request_id,
                    Method::GetAppSessions,
                    serde_json::json!({"app_sessions": []}),
                ),
            ],
            _ => lifecycle_script(message),
        })
        .await;
        let client = client_for(&relay, "balance").await;

        let seen: Arc<StdMutex<Vec<LedgerBalance>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            client.on_balance_update(move |balances| {
                seen.lock().unwrap().extend_from_slice(balances);
            });
        }

        client.connect();
        wait_for_state(client.transport(), ConnectionState::Connected).await;
        client.set_wallet(Arc::new(WalletKey::generate())).await.unwrap();
        client.query_sessions(None).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].asset, "usdc");
        assert_eq!(seen[0].amount, "42");
    }

    #[tokio::test]
    async fn disconnect_rotates_session_key_and_resets_auth() {
        let relay = MockRelay::spawn(lifecycle_script).await;
        let keystore_dir = temp_dir("disconnect");
        let mut config = ClearwayConfig::new(relay.url(), keystore_dir.clone());
        config.auth.request_timeout = Duration::from_secs(2);
        let client = ClearwayClient::new(config).expect("client");

        let keystore = Keystore::new(keystore_dir.clone());
        let original = keystore.load_session_key().expect("persisted key").address().to_string();

        client.connect();
        wait_for_state(client.transport(), ConnectionState::Connected).await;
        client.set_wallet(Arc::new(WalletKey::generate())).await.unwrap();
        assert!(client.is_authenticated());
        assert!(keystore.load_bearer_token().is_some());

        client.disconnect().unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.is_authenticated());
        assert_eq!(client.auth_state(), AuthState::Idle);
        assert!(keystore.load_bearer_token().is_none());

        let rotated = keystore.load_session_key().expect("fresh key").address().to_string();
        assert_ne!(rotated, original);

        // Reconnecting re-runs the handshake under the rotated key.
        client.connect();
        wait_for_state(client.transport(), ConnectionState::Connected).await;
        for _ in 0..200 {
            if client.is_authenticated() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_authenticated());
        assert_eq!(relay.requests_of(Method::AuthRequest), 2);
        std::fs::remove_dir_all(keystore_dir).ok();
    }
}
