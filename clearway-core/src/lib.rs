//! # clearway-core
//!
//! Core library for the Clearway session protocol: wire envelopes, signing
//! primitives, identities, and the state automata shared by client
//! implementations. The runtime (transport, correlation, lifecycle
//! management) lives in `clearway-client`.

pub mod error;
pub mod identity;
pub mod message;
pub mod security;
pub mod session;
pub mod state;

pub use error::{ClearwayError, ClearwayResult};
pub use identity::{SessionKey, Signer, StoredSessionKey, WalletKey};
pub use message::{
    Allocation, Allowance, AppDefinition, AuthChallengeParams, AuthContext, AuthVerifyParams,
    AuthVerifyReply, BalanceUpdateParams, CloseSessionParams, CreateSessionParams, ErrorParams,
    GetLedgerBalancesParams, GetLedgerBalancesReply, GetSessionsParams, GetSessionsReply,
    LedgerBalance, Method, RequestFrame, ResponseFrame, RpcMessage, SessionRecord, SessionReply,
    SubmitStateParams,
};
pub use security::{canonical_json, derive_address, sign_payload, verify_payload};
pub use session::{equal_weights, AppSession, QuorumPolicy};
pub use state::{AuthEvent, AuthState, SessionStatus};

/// Protocol tag stamped into session definitions.
pub const PROTOCOL_VERSION: &str = "clearway_v1";
