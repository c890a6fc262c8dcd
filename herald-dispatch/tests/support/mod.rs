//! Scripted collaborators for dispatch tests
//!
//! - [`RecordingTransport`]: records delivered messages, can delay, reject
//!   chosen recipients permanently, or fail every attempt transiently, and
//!   tracks how many sends it saw at once
//! - [`SharedConnector`]: hands out one shared transport and counts connects
//! - [`SlowLookup`]: a static registry behind an artificial delay
//! - [`render`]: a renderer that echoes its variables
#![allow(dead_code)] // Test utility module - not all helpers used in every test

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use herald_common::DomainKey;
use herald_dispatch::{
    ConfigLookup, ConfigLookupError, Connector, DispatchConfig, DispatchEngine, Interrupt,
    OutboundMessage, RenderError, Renderer, StaticTransports, Transport, TransportConfig,
    TransportError, Variables,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    rejected: HashSet<String>,
    always_fail: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every send for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer `550` for `recipient`
    pub fn rejecting(mut self, recipient: &str) -> Self {
        self.rejected.insert(recipient.to_string());
        self
    }

    /// Fail every attempt with a connection error
    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut recipients: Vec<_> = self.sent.lock().iter().map(|m| m.to.clone()).collect();
        recipients.sort();
        recipients
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.always_fail {
            return Err(TransportError::Connection("connection reset".to_string()));
        }

        if self.rejected.contains(&message.to) {
            return Err(TransportError::Rejected {
                code: 550,
                message: "mailbox unavailable".to_string(),
            });
        }

        self.sent.lock().push(message.clone());
        Ok(())
    }
}

pub struct SharedConnector {
    transport: Arc<RecordingTransport>,
    connects: AtomicUsize,
}

impl SharedConnector {
    pub fn new(transport: Arc<RecordingTransport>) -> Self {
        Self {
            transport,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SharedConnector {
    async fn connect(
        &self,
        _config: &TransportConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.transport.clone())
    }
}

pub struct SlowLookup {
    inner: StaticTransports,
    delay: Duration,
    resolves: AtomicUsize,
}

impl SlowLookup {
    pub fn new(inner: StaticTransports, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            resolves: AtomicUsize::new(0),
        }
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigLookup for SlowLookup {
    async fn resolve(&self, domain: &DomainKey) -> Result<TransportConfig, ConfigLookupError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.resolve(domain).await
    }
}

/// Renders `[template] company=<company_name> key=value ...`; `missing` is unknown
pub fn render(template: &str, variables: &Variables) -> Result<String, RenderError> {
    if template == "missing" {
        return Err(RenderError::UnknownTemplate(template.to_string()));
    }

    let company = variables.get("company_name").map_or("", String::as_str);
    let rest: Vec<String> = variables
        .iter()
        .filter(|(key, _)| key.as_str() != "company_name")
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    Ok(format!("[{template}] company={company} {}", rest.join(" ")))
}

pub fn renderer() -> Arc<dyn Renderer> {
    Arc::new(render)
}

/// Defaults with every delay shrunk so tests finish quickly
pub fn fast_config() -> DispatchConfig {
    let mut config = DispatchConfig::default();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.rate_limit.permits_per_window = 10_000;
    config.domain_rate_limits.default.permits_per_window = 10_000;
    config.rate_limit_retry.retry_delay_ms = 1;
    config.batch.inter_batch_delay_ms = 1;
    config
}

pub struct Harness {
    pub engine: DispatchEngine,
    pub transport: Arc<RecordingTransport>,
    pub connector: Arc<SharedConnector>,
}

pub fn harness(config: DispatchConfig, transport: RecordingTransport) -> Harness {
    harness_with(config, transport, Interrupt::never())
}

pub fn harness_with(
    config: DispatchConfig,
    transport: RecordingTransport,
    interrupt: Interrupt,
) -> Harness {
    let transport = Arc::new(transport);
    let connector = Arc::new(SharedConnector::new(transport.clone()));

    let engine = DispatchEngine::builder(config)
        .connector(connector.clone())
        .renderer(renderer())
        .interrupt(interrupt)
        .build()
        .unwrap();

    Harness {
        engine,
        transport,
        connector,
    }
}
