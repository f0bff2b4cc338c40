//! In-process transport for tests
//!
//! Routes requests straight to registered handlers by endpoint string,
//! no sockets involved. Two instances sharing one `LoopbackNetwork` can
//! pair and sync inside a single test.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{NetError, RequestHandler, Transport, WireEnvelope};

#[derive(Default)]
pub struct LoopbackNetwork {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().await.insert(endpoint.into(), handler);
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn request(
        &self,
        endpoint: &str,
        envelope: WireEnvelope,
    ) -> Result<WireEnvelope, NetError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(endpoint)
            .cloned()
            .ok_or_else(|| NetError::NoRoute(endpoint.to_string()))?;
        Ok(handler.handle(envelope).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::WireKind;
    use uuid::Uuid;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, envelope: WireEnvelope) -> WireEnvelope {
            WireEnvelope::new(envelope.from, WireKind::Ack, envelope.body)
        }
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let net = LoopbackNetwork::new();
        net.register("a:1", Arc::new(Echo)).await;

        let reply = net
            .request(
                "a:1",
                WireEnvelope::new(Uuid::new_v4(), WireKind::Sync, vec![1, 2]),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, WireKind::Ack);
        assert_eq!(reply.body, vec![1, 2]);

        assert!(matches!(
            net.request(
                "b:2",
                WireEnvelope::new(Uuid::new_v4(), WireKind::Sync, vec![])
            )
            .await,
            Err(NetError::NoRoute(_))
        ));
    }
}
