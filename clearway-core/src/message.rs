//! Wire messages for the Clearway relay protocol.
//!
//! Every frame is a JSON text envelope carrying a positional payload tuple
//! `[request_id, method, params, timestamp_ms]` under a `"req"` (client to
//! relay) or `"res"` (relay to client) key, plus a `"sig"` list of encoded
//! signatures over the canonical payload. Inbound traffic is classified by
//! method name and embedded params; request ids are only authoritative on
//! `error` envelopes, which echo the id of the offending request.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClearwayError, ClearwayResult};
use crate::identity::Signer;
use crate::security::canonical_json;

/// Relay method tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    CreateAppSession,
    SubmitAppState,
    CloseAppSession,
    GetAppSessions,
    GetLedgerBalances,
    BalanceUpdate,
    Error,
    /// Methods this client does not speak; parsed but never routed.
    #[serde(other)]
    Unknown,
}

/// The positional payload tuple shared by requests and responses.
pub type Payload = (u64, Method, serde_json::Value, u64);

/// An outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub req: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sig: Vec<String>,
}

impl RequestFrame {
    /// Build an unsigned request with the current timestamp.
    pub fn new(request_id: u64, method: Method, params: serde_json::Value) -> Self {
        Self {
            req: (request_id, method, params, now_ms()),
            sig: Vec::new(),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.req.0
    }

    pub fn method(&self) -> Method {
        self.req.1
    }

    /// Canonical bytes of the payload tuple, the exact input to signing.
    pub fn payload_bytes(&self) -> ClearwayResult<Vec<u8>> {
        let value = serde_json::to_value(&self.req)?;
        Ok(canonical_json(&value).into_bytes())
    }

    /// Append a signature from the given signer.
    pub fn signed(mut self, signer: &dyn Signer) -> ClearwayResult<Self> {
        let payload = self.payload_bytes()?;
        self.sig.push(signer.sign(&payload)?);
        Ok(self)
    }

    /// The JSON text frame handed to the transport.
    pub fn to_text(&self) -> ClearwayResult<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

/// An outbound response envelope. The client never produces these; they
/// exist so tests and tooling can speak the relay side of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub res: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sig: Vec<String>,
}

impl ResponseFrame {
    pub fn new(request_id: u64, method: Method, params: serde_json::Value) -> Self {
        Self {
            res: (request_id, method, params, now_ms()),
            sig: Vec::new(),
        }
    }

    pub fn to_text(&self) -> ClearwayResult<String> {
        serde_json::to_string(self).map_err(Into::into)
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    res: Option<Payload>,
    #[serde(default)]
    req: Option<Payload>,
    #[serde(default)]
    sig: Vec<String>,
}

/// A parsed inbound message, as delivered to message listeners.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    pub request_id: u64,
    pub method: Method,
    pub params: serde_json::Value,
    pub timestamp: u64,
    pub signatures: Vec<String>,
}

impl RpcMessage {
    /// Parse a raw text frame. Frames missing both payload keys are
    /// malformed and rejected here, at the transport boundary.
    pub fn parse(raw: &str) -> ClearwayResult<Self> {
        let frame: InboundFrame = serde_json::from_str(raw)?;
        let (request_id, method, params, timestamp) = frame
            .res
            .or(frame.req)
            .ok_or_else(|| ClearwayError::Protocol("frame carries no payload".to_string()))?;
        Ok(Self {
            request_id,
            method,
            params,
            timestamp,
            signatures: frame.sig,
        })
    }

    pub fn is_error(&self) -> bool {
        self.method == Method::Error
    }

    /// Deserialize the params into a typed shape.
    pub fn params_as<T: DeserializeOwned>(&self) -> ClearwayResult<T> {
        serde_json::from_value(self.params.clone()).map_err(Into::into)
    }

    /// The human-readable message of an `error` envelope, if this is one.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        self.params_as::<ErrorParams>()
            .map(|p| p.error)
            .ok()
            .or_else(|| Some(self.params.to_string()))
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Scoped, time-bounded authorization context binding a session key to a
/// wallet identity. Built fresh for every authentication attempt and
/// immutable once the challenge/verify exchange starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    #[serde(rename = "address")]
    pub wallet_address: String,
    #[serde(rename = "session_key")]
    pub session_key_address: String,
    pub app_name: String,
    pub scope: String,
    #[serde(rename = "expire")]
    pub expire_timestamp: u64,
    pub allowances: Vec<Allowance>,
    /// Previously-issued bearer token, offered so the relay may skip the
    /// challenge on reconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

impl AuthContext {
    /// The canonical bytes the wallet signs to bind this context to a
    /// relay-issued challenge.
    pub fn binding_bytes(&self, challenge: &str) -> ClearwayResult<Vec<u8>> {
        let value = serde_json::json!({
            "challenge": challenge,
            "scope": self.scope,
            "wallet": self.wallet_address,
            "session_key": self.session_key_address,
            "app_name": self.app_name,
            "expire": self.expire_timestamp,
            "allowances": self.allowances,
        });
        Ok(canonical_json(&value).into_bytes())
    }
}

/// A spending allowance granted to the session key for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: String,
}

/// Params of the relay's `auth_challenge` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallengeParams {
    pub challenge_message: String,
}

/// Params of the client's `auth_verify` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthVerifyParams {
    pub challenge: String,
    pub signature: String,
}

/// Params of the relay's `auth_verify` success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthVerifyReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

/// Immutable definition of an application session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDefinition {
    pub protocol: String,
    pub participants: Vec<String>,
    pub weights: Vec<u32>,
    pub quorum: u32,
    pub challenge: u32,
    pub nonce: u64,
}

/// A per-participant asset allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub participant: String,
    pub asset: String,
    pub amount: String,
}

/// Params of `create_app_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionParams {
    pub definition: AppDefinition,
    pub allocations: Vec<Allocation>,
}

/// Success reply to create/submit/close, each echoing the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReply {
    pub app_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Params of `submit_app_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitStateParams {
    pub app_session_id: String,
    pub session_data: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocations: Vec<Allocation>,
}

/// Params of `close_app_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionParams {
    pub app_session_id: String,
    pub allocations: Vec<Allocation>,
}

/// Params of `get_app_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionsParams {
    pub participant: String,
}

/// A session record as the relay reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub app_session_id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub weights: Vec<u32>,
    #[serde(default)]
    pub quorum: Option<u32>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    #[serde(default)]
    pub session_data: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Reply to `get_app_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSessionsReply {
    pub app_sessions: Vec<SessionRecord>,
}

/// Params of `get_ledger_balances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLedgerBalancesParams {
    pub participant: String,
}

/// One asset balance on the relay's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub asset: String,
    pub amount: String,
}

/// Reply to `get_ledger_balances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLedgerBalancesReply {
    #[serde(default)]
    pub ledger_balances: Vec<LedgerBalance>,
}

/// Params of an unsolicited `balance_update` push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdateParams {
    #[serde(default)]
    pub balance_updates: Vec<LedgerBalance>,
}

/// Params of an `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorParams {
    pub error: String,
}
