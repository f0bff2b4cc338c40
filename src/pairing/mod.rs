//! Device pairing protocol
//!
//! Two instances establish mutual trust with a signed request/response
//! exchange plus a user-visible one-time token. Each side proves
//! possession of its ed25519 signing key (the signature is checked
//! against the key embedded in the message itself), the responder checks
//! the token against the one currently displayed, and both sides derive
//! an AES-256-GCM session key from their X25519 key pairs. Any
//! verification failure rejects the pairing and leaves existing trust
//! untouched.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use rand::RngCore;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as _, UnparsedPublicKey, ED25519};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use x25519_dalek::{PublicKey as CryptPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::net::{Transport, WireEnvelope, WireKind};
use crate::peers::PeerRegistry;
use crate::record::DeviceId;

const HKDF_SALT: &[u8] = b"pastebeam pairing v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("signature verification failed")]
    BadSignature,

    #[error("pairing token mismatch")]
    TokenMismatch,

    #[error("no pairing token is currently displayed")]
    NoTokenDisplayed,

    #[error("malformed key material: {0}")]
    BadKey(String),

    #[error("decryption failed")]
    Decrypt,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] crate::net::NetError),

    #[error("peer rejected pairing: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric session key derived after pairing. Held in memory only and
/// wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Encrypt `plaintext`; output is nonce || ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, PairingError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| PairingError::Decrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt nonce || ciphertext produced by [`seal`](Self::seal).
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, PairingError> {
        if data.len() <= NONCE_LEN {
            return Err(PairingError::Decrypt);
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(&data[..NONCE_LEN]), &data[NONCE_LEN..])
            .map_err(|_| PairingError::Decrypt)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionKey").field(&"[REDACTED]").finish()
    }
}

/// This instance's long-lived key material: an ed25519 signing pair and
/// an X25519 agreement pair.
pub struct DeviceKeys {
    signing: Ed25519KeyPair,
    pkcs8: Vec<u8>,
    crypt_secret: StaticSecret,
}

#[derive(Serialize, Deserialize)]
struct PersistedKeys {
    sign_pkcs8: String,
    crypt_secret: String,
}

impl DeviceKeys {
    pub fn generate() -> Result<Self, PairingError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| PairingError::BadKey("pkcs8 generation failed".into()))?;
        let signing = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| PairingError::BadKey("pkcs8 parse failed".into()))?;
        Ok(Self {
            signing,
            pkcs8: pkcs8.as_ref().to_vec(),
            crypt_secret: StaticSecret::random(),
        })
    }

    /// Load keys from `path`, generating and persisting a fresh pair on
    /// first run.
    pub async fn load_or_generate(path: &Path) -> Result<Self, PairingError> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let persisted: PersistedKeys = serde_json::from_str(&content)?;
            let pkcs8 = BASE64
                .decode(&persisted.sign_pkcs8)
                .map_err(|e| PairingError::BadKey(format!("bad pkcs8 encoding: {e}")))?;
            let signing = Ed25519KeyPair::from_pkcs8(&pkcs8)
                .map_err(|_| PairingError::BadKey("pkcs8 parse failed".into()))?;
            let crypt_bytes: [u8; 32] = BASE64
                .decode(&persisted.crypt_secret)
                .map_err(|e| PairingError::BadKey(format!("bad secret encoding: {e}")))?
                .try_into()
                .map_err(|_| PairingError::BadKey("x25519 secret must be 32 bytes".into()))?;
            return Ok(Self {
                signing,
                pkcs8,
                crypt_secret: StaticSecret::from(crypt_bytes),
            });
        }

        let keys = Self::generate()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let persisted = PersistedKeys {
            sign_pkcs8: BASE64.encode(&keys.pkcs8),
            crypt_secret: BASE64.encode(keys.crypt_secret.to_bytes()),
        };
        tokio::fs::write(path, serde_json::to_string_pretty(&persisted)?).await?;
        info!(path = %path.display(), "generated device key pair");
        Ok(keys)
    }

    pub fn sign_public(&self) -> Vec<u8> {
        self.signing.public_key().as_ref().to_vec()
    }

    pub fn crypt_public(&self) -> [u8; 32] {
        CryptPublicKey::from(&self.crypt_secret).to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).as_ref().to_vec()
    }

    /// Derive the shared session key for a peer from its X25519 public
    /// key. Both sides compute the same key because the HKDF info is the
    /// sorted pair of public keys.
    pub fn derive_session_key(&self, peer_crypt_public: &[u8]) -> Result<SessionKey, PairingError> {
        let peer_bytes: [u8; 32] = peer_crypt_public
            .try_into()
            .map_err(|_| PairingError::BadKey("x25519 public key must be 32 bytes".into()))?;
        let shared = self
            .crypt_secret
            .diffie_hellman(&CryptPublicKey::from(peer_bytes));

        let ours = self.crypt_public();
        let (lo, hi) = if ours <= peer_bytes {
            (ours, peer_bytes)
        } else {
            (peer_bytes, ours)
        };
        let mut info = Vec::with_capacity(64);
        info.extend_from_slice(&lo);
        info.extend_from_slice(&hi);

        let salt = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, HKDF_SALT);
        let prk = salt.extract(shared.as_bytes());
        let info_parts: [&[u8]; 1] = [&info];
        let okm = prk
            .expand(&info_parts, ring::hkdf::HKDF_SHA256)
            .map_err(|_| PairingError::BadKey("hkdf expand failed".into()))?;
        let mut key = [0u8; 32];
        okm.fill(&mut key)
            .map_err(|_| PairingError::BadKey("hkdf fill failed".into()))?;
        Ok(SessionKey::from_bytes(key))
    }
}

/// Signed body of a pairing request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub device_id: DeviceId,
    pub device_name: String,
    /// base64 ed25519 public key; the signature is verified against this
    /// embedded key (proof of possession).
    pub sign_public_key: String,
    /// base64 X25519 public key.
    pub crypt_public_key: String,
    pub token: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPairing {
    pub payload: PairingPayload,
    /// base64 signature over the serialized payload.
    pub signature: String,
}

impl SignedPairing {
    pub fn sign(keys: &DeviceKeys, payload: PairingPayload) -> Result<Self, PairingError> {
        let bytes = serde_json::to_vec(&payload)?;
        let signature = BASE64.encode(keys.sign(&bytes));
        Ok(Self { payload, signature })
    }

    /// Verify the signature against the payload's own embedded signing
    /// key. Returns the raw key bytes on success.
    pub fn verify(&self) -> Result<Vec<u8>, PairingError> {
        let key_bytes = BASE64
            .decode(&self.payload.sign_public_key)
            .map_err(|_| PairingError::BadSignature)?;
        let signature = BASE64
            .decode(&self.signature)
            .map_err(|_| PairingError::BadSignature)?;
        let message = serde_json::to_vec(&self.payload)?;
        UnparsedPublicKey::new(&ED25519, &key_bytes)
            .verify(&message, &signature)
            .map_err(|_| PairingError::BadSignature)?;
        Ok(key_bytes)
    }
}

/// Per-peer pairing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Discovered,
    Requesting,
    AwaitingResponse,
    Paired,
    Rejected,
}

pub struct PairingManager {
    keys: Arc<DeviceKeys>,
    device_id: DeviceId,
    device_name: String,
    registry: Arc<PeerRegistry>,
    displayed_token: Mutex<Option<u32>>,
    states: RwLock<HashMap<DeviceId, PairingState>>,
}

impl PairingManager {
    pub fn new(
        keys: Arc<DeviceKeys>,
        device_id: DeviceId,
        device_name: String,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            keys,
            device_id,
            device_name,
            registry,
            displayed_token: Mutex::new(None),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state_of(&self, peer: DeviceId) -> Option<PairingState> {
        self.states.read().await.get(&peer).copied()
    }

    async fn set_state(&self, peer: DeviceId, state: PairingState) {
        self.states.write().await.insert(peer, state);
    }

    /// Generate and remember a fresh 6-digit one-time token. The caller
    /// shows it to the user (text or QR).
    pub async fn display_token(&self) -> u32 {
        let token = 100_000 + rand::rng().next_u32() % 900_000;
        *self.displayed_token.lock().await = Some(token);
        token
    }

    fn our_payload(&self, token: u32) -> PairingPayload {
        PairingPayload {
            device_id: self.device_id,
            device_name: self.device_name.clone(),
            sign_public_key: BASE64.encode(self.keys.sign_public()),
            crypt_public_key: BASE64.encode(self.keys.crypt_public()),
            token,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Responder side: verify an inbound request against the displayed
    /// token and reply signed. Trust state for the peer changes only on
    /// success.
    pub async fn handle_request(
        &self,
        signed: SignedPairing,
        endpoint: Option<String>,
    ) -> Result<SignedPairing, PairingError> {
        let sign_key = match signed.verify() {
            Ok(key) => key,
            Err(e) => {
                warn!("pairing request with invalid signature rejected");
                return Err(e);
            }
        };
        let peer = signed.payload.device_id;

        let expected = self
            .displayed_token
            .lock()
            .await
            .ok_or(PairingError::NoTokenDisplayed)?;
        let matches: bool = expected
            .to_le_bytes()
            .ct_eq(&signed.payload.token.to_le_bytes())
            .into();
        if !matches {
            warn!(peer = %peer, "pairing token mismatch, rejecting");
            self.set_state(peer, PairingState::Rejected).await;
            return Err(PairingError::TokenMismatch);
        }
        // One-shot: a matched token cannot be replayed.
        *self.displayed_token.lock().await = None;

        let crypt_key = BASE64
            .decode(&signed.payload.crypt_public_key)
            .map_err(|_| PairingError::BadKey("bad crypt key encoding".into()))?;
        let session_key = self.keys.derive_session_key(&crypt_key)?;

        self.registry
            .upsert_paired(
                peer,
                signed.payload.device_name.clone(),
                sign_key,
                crypt_key,
                endpoint,
                session_key,
            )
            .await?;
        self.set_state(peer, PairingState::Paired).await;
        info!(peer = %peer, name = %signed.payload.device_name, "peer paired");

        SignedPairing::sign(&self.keys, self.our_payload(signed.payload.token))
    }

    /// Requester side: send a signed request carrying the token the
    /// responder is displaying, verify the signed response, and derive
    /// the session key. `peer_hint` is the discovered peer id when
    /// known, used only to expose the transient protocol state.
    pub async fn request_pairing(
        &self,
        transport: &dyn Transport,
        endpoint: &str,
        token: u32,
        peer_hint: Option<DeviceId>,
    ) -> Result<DeviceId, PairingError> {
        let signed = SignedPairing::sign(&self.keys, self.our_payload(token))?;
        let body = serde_json::to_vec(&signed)?;

        if let Some(peer) = peer_hint {
            self.set_state(peer, PairingState::Requesting).await;
        }
        let request = WireEnvelope::new(self.device_id, WireKind::PairingRequest, body);
        if let Some(peer) = peer_hint {
            self.set_state(peer, PairingState::AwaitingResponse).await;
        }
        let reply = transport.request(endpoint, request).await?;

        if reply.kind == WireKind::Error {
            if let Some(peer) = peer_hint {
                self.set_state(peer, PairingState::Rejected).await;
            }
            return Err(PairingError::Rejected(
                String::from_utf8_lossy(&reply.body).into_owned(),
            ));
        }

        let response: SignedPairing = serde_json::from_slice(&reply.body)?;
        let sign_key = response.verify()?;
        let peer = response.payload.device_id;

        let echoed: bool = response
            .payload
            .token
            .to_le_bytes()
            .ct_eq(&token.to_le_bytes())
            .into();
        if !echoed {
            self.set_state(peer, PairingState::Rejected).await;
            return Err(PairingError::TokenMismatch);
        }

        let crypt_key = BASE64
            .decode(&response.payload.crypt_public_key)
            .map_err(|_| PairingError::BadKey("bad crypt key encoding".into()))?;
        let session_key = self.keys.derive_session_key(&crypt_key)?;

        self.registry
            .upsert_paired(
                peer,
                response.payload.device_name.clone(),
                sign_key,
                crypt_key,
                Some(endpoint.to_string()),
                session_key,
            )
            .await?;
        self.set_state(peer, PairingState::Paired).await;
        info!(peer = %peer, "paired with remote device");
        Ok(peer)
    }
}
