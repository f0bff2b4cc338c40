//! Peer discovery
//!
//! Discovery is an external service that republishes `{endpoint,
//! metadata}` tuples; the sync layer only consumes this trait. The mDNS
//! adapter covers LAN deployments, the static adapter covers configured
//! peer lists and tests.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::record::DeviceId;

const SERVICE_TYPE: &str = "_pastebeam._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns error: {0}")]
    Mdns(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(e: mdns_sd::Error) -> Self {
        DiscoveryError::Mdns(e.to_string())
    }
}

/// One discovery observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: DeviceId,
    pub name: String,
    /// `host:port` reachable for pairing and sync.
    pub endpoint: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Advertise this instance.
    async fn publish(
        &self,
        endpoint: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), DiscoveryError>;

    /// Stream of peer observations, repeated as records refresh.
    async fn subscribe(&self) -> Result<mpsc::Receiver<DiscoveredPeer>, DiscoveryError>;
}

/// mDNS/DNS-SD discovery.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    device_id: DeviceId,
    device_name: String,
}

impl MdnsDiscovery {
    pub fn new(device_id: DeviceId, device_name: String) -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            device_id,
            device_name,
        })
    }

    fn parse_event(event: ServiceEvent, own_id: DeviceId) -> Option<DiscoveredPeer> {
        let info = match event {
            ServiceEvent::ServiceResolved(info) => info,
            _ => return None,
        };

        let instance = info.get_fullname().split('.').next()?;
        let device_id = Uuid::parse_str(instance).ok()?;
        if device_id == own_id {
            return None;
        }

        let address: IpAddr = *info.get_addresses().iter().next()?;
        let endpoint = format!("{}:{}", address, info.get_port());

        let mut metadata = HashMap::new();
        for prop in info.get_properties().iter() {
            metadata.insert(prop.key().to_string(), prop.val_str().to_string());
        }
        let name = metadata
            .get("name")
            .cloned()
            .unwrap_or_else(|| instance.to_string());

        Some(DiscoveredPeer {
            device_id,
            name,
            endpoint,
            metadata,
        })
    }
}

#[async_trait]
impl Discovery for MdnsDiscovery {
    async fn publish(
        &self,
        endpoint: &str,
        mut metadata: HashMap<String, String>,
    ) -> Result<(), DiscoveryError> {
        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::InvalidEndpoint(endpoint.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| DiscoveryError::InvalidEndpoint(endpoint.to_string()))?;

        metadata.insert("name".to_string(), self.device_name.clone());

        let hostname = format!("{}.local.", gethostname::gethostname().to_string_lossy());
        let instance = self.device_id.to_string();

        let service = if host == "0.0.0.0" || host == "::" {
            ServiceInfo::new(SERVICE_TYPE, &instance, &hostname, "", port, metadata)?
                .enable_addr_auto()
        } else {
            ServiceInfo::new(SERVICE_TYPE, &instance, &hostname, host, port, metadata)?
        };

        self.daemon.register(service)?;
        debug!(port, "published mdns service");
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<DiscoveredPeer>, DiscoveryError> {
        let browser = self.daemon.browse(SERVICE_TYPE)?;
        let (tx, rx) = mpsc::channel(32);
        let own_id = self.device_id;

        tokio::spawn(async move {
            loop {
                match browser.recv_async().await {
                    Ok(event) => {
                        if let Some(peer) = Self::parse_event(event, own_id) {
                            if tx.send(peer).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("mdns browse channel closed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Fixed peer list from configuration; also used by tests.
pub struct StaticDiscovery {
    peers: Vec<DiscoveredPeer>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<DiscoveredPeer>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn publish(
        &self,
        _endpoint: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<(), DiscoveryError> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<DiscoveredPeer>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        for peer in &self.peers {
            let _ = tx.send(peer.clone()).await;
        }
        Ok(rx)
    }
}
