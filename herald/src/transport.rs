//! Dry-run transport: logs each message instead of delivering it

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use herald_common::outgoing;
use herald_dispatch::{Connector, OutboundMessage, Transport, TransportConfig, TransportError};

#[derive(Debug)]
pub struct LogTransport {
    address: String,
    sent: AtomicU64,
}

impl LogTransport {
    /// Messages "sent" through this handle
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        outgoing!(
            level = INFO,
            via = %self.address,
            from = %message.from,
            to = %message.to,
            subject = %message.subject,
            bytes = message.body.len(),
            "Dry run, message not delivered"
        );
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Builds a [`LogTransport`] for every configuration
#[derive(Debug, Default)]
pub struct LogConnector;

#[async_trait]
impl Connector for LogConnector {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(LogTransport {
            address: config.address(),
            sent: AtomicU64::new(0),
        }))
    }
}
