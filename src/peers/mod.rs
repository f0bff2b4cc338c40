//! Peer registry
//!
//! Tracks every known peer device: its public keys, trust state, last
//! known endpoint and (for paired peers) the in-memory session key.
//! Trust-relevant fields persist as JSON across restarts; session keys
//! never touch disk. Discovery updates endpoints but can never upgrade
//! or downgrade trust.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveredPeer;
use crate::pairing::{PairingError, SessionKey};
use crate::record::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustState {
    /// Seen via discovery, never paired.
    Unverified,
    /// Mutual pairing completed.
    Paired,
    /// Trust revoked after a verification failure.
    Untrusted,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PeerDevice {
    pub id: DeviceId,
    pub name: String,
    /// ed25519 public signing key.
    pub sign_key: Vec<u8>,
    /// X25519 public encryption key.
    pub crypt_key: Vec<u8>,
    pub endpoint: Option<String>,
    pub trust: TrustState,
    pub last_seen: i64,
    /// Derived per-session symmetric key; memory only.
    #[serde(skip)]
    pub session_key: Option<SessionKey>,
}

impl std::fmt::Debug for PeerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("trust", &self.trust)
            .field("session_key", &self.session_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub struct PeerRegistry {
    path: Option<PathBuf>,
    peers: RwLock<HashMap<DeviceId, PeerDevice>>,
}

impl PeerRegistry {
    /// Registry persisted at `path` (loaded immediately).
    pub async fn load(path: PathBuf) -> Result<Self, PairingError> {
        let mut peers = HashMap::new();
        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let list: Vec<PeerDevice> = serde_json::from_str(&content)?;
            for peer in list {
                peers.insert(peer.id, peer);
            }
            info!(count = peers.len(), "loaded peer registry");
        }
        Ok(Self {
            path: Some(path),
            peers: RwLock::new(peers),
        })
    }

    /// Volatile registry for tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            peers: RwLock::new(HashMap::new()),
        }
    }

    async fn save(&self) -> Result<(), PairingError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let peers = self.peers.read().await;
        let list: Vec<&PeerDevice> = peers.values().collect();
        let content = serde_json::to_string_pretty(&list)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub async fn get(&self, id: DeviceId) -> Option<PeerDevice> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<PeerDevice> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Paired peers holding a live session key, i.e. sync targets.
    pub async fn paired_peers(&self) -> Vec<PeerDevice> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.trust == TrustState::Paired && p.session_key.is_some())
            .cloned()
            .collect()
    }

    pub async fn session_key_for(&self, id: DeviceId) -> Option<SessionKey> {
        self.peers
            .read()
            .await
            .get(&id)
            .filter(|p| p.trust == TrustState::Paired)
            .and_then(|p| p.session_key.clone())
    }

    /// Record a successful pairing: keys, trust and session key.
    pub async fn upsert_paired(
        &self,
        id: DeviceId,
        name: String,
        sign_key: Vec<u8>,
        crypt_key: Vec<u8>,
        endpoint: Option<String>,
        session_key: SessionKey,
    ) -> Result<(), PairingError> {
        {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(id).or_insert_with(|| PeerDevice {
                id,
                name: name.clone(),
                sign_key: Vec::new(),
                crypt_key: Vec::new(),
                endpoint: None,
                trust: TrustState::Unverified,
                last_seen: 0,
                session_key: None,
            });
            entry.name = name;
            entry.sign_key = sign_key;
            entry.crypt_key = crypt_key;
            if endpoint.is_some() {
                entry.endpoint = endpoint;
            }
            entry.trust = TrustState::Paired;
            entry.last_seen = Utc::now().timestamp();
            entry.session_key = Some(session_key);
        }
        self.save().await
    }

    /// Fold in a discovery observation. New peers enter Unverified;
    /// known peers only refresh endpoint and liveness.
    pub async fn observe_discovered(&self, discovered: &DiscoveredPeer) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&discovered.device_id) {
            Some(peer) => {
                peer.endpoint = Some(discovered.endpoint.clone());
                peer.last_seen = Utc::now().timestamp();
                debug!(peer = %discovered.device_id, endpoint = %discovered.endpoint, "refreshed peer endpoint");
            }
            None => {
                peers.insert(
                    discovered.device_id,
                    PeerDevice {
                        id: discovered.device_id,
                        name: discovered.name.clone(),
                        sign_key: Vec::new(),
                        crypt_key: Vec::new(),
                        endpoint: Some(discovered.endpoint.clone()),
                        trust: TrustState::Unverified,
                        last_seen: Utc::now().timestamp(),
                        session_key: None,
                    },
                );
                debug!(peer = %discovered.device_id, "discovered new peer");
            }
        }
    }

    /// Revoke trust after a verification failure during sync. Drops the
    /// session key so no further traffic is sent.
    pub async fn mark_untrusted(&self, id: DeviceId) -> Result<(), PairingError> {
        {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.get_mut(&id) {
                warn!(peer = %id, name = %peer.name, "revoking peer trust");
                peer.trust = TrustState::Untrusted;
                peer.session_key = None;
            }
        }
        self.save().await
    }
}
