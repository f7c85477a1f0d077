//! Signing identities: the opaque signer capability, the ephemeral session
//! key, and a local wallet key usable where no external wallet is wired in.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{ClearwayError, ClearwayResult};
use crate::security::{derive_address, hex_decode, hex_encode, sign_payload};

/// An opaque signing capability.
///
/// The handshake binds a wallet-held instance to a session-key instance;
/// after that, every lifecycle call is signed with the session key alone.
/// Implementations may refuse to sign (a user declining a wallet prompt),
/// which surfaces as [`ClearwayError::SignatureRejected`].
pub trait Signer: Send + Sync {
    /// The address this signer acts for.
    fn address(&self) -> &str;

    /// Sign raw payload bytes, returning an encoded signature.
    fn sign(&self, payload: &[u8]) -> ClearwayResult<String>;
}

/// Ephemeral session keypair.
///
/// Generated once per client profile, persisted locally, destroyed and
/// regenerated on explicit disconnect. Never leaves the local client.
#[derive(Clone)]
pub struct SessionKey {
    address: String,
    signing_key: SigningKey,
}

impl SessionKey {
    /// Generate a fresh session key.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = derive_address(&signing_key.verifying_key());
        Self {
            address,
            signing_key,
        }
    }

    /// The session key's derived address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The public half, for verification.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Serializable storage form. The secret is hex-encoded; callers are
    /// responsible for where it lands.
    pub fn to_stored(&self) -> StoredSessionKey {
        StoredSessionKey {
            address: self.address.clone(),
            private_key: format!("0x{}", hex_encode(&self.signing_key.to_bytes())),
        }
    }

    /// Reconstruct from the storage form.
    pub fn from_stored(stored: &StoredSessionKey) -> ClearwayResult<Self> {
        let bytes = hex_decode(&stored.private_key)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClearwayError::Crypto("session key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&bytes);
        let address = derive_address(&signing_key.verifying_key());
        Ok(Self {
            address,
            signing_key,
        })
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret half in logs.
        f.debug_struct("SessionKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer for SessionKey {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, payload: &[u8]) -> ClearwayResult<String> {
        Ok(sign_payload(payload, &self.signing_key))
    }
}

/// Persisted form of a [`SessionKey`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSessionKey {
    pub address: String,
    pub private_key: String,
}

/// A locally-held wallet key.
///
/// Stands in for an external wallet signer in tests and demos; production
/// integrations supply their own [`Signer`] bound to the real wallet.
#[derive(Clone)]
pub struct WalletKey {
    address: String,
    signing_key: SigningKey,
}

impl WalletKey {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = derive_address(&signing_key.verifying_key());
        Self {
            address,
            signing_key,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for WalletKey {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, payload: &[u8]) -> ClearwayResult<String> {
        Ok(sign_payload(payload, &self.signing_key))
    }
}
