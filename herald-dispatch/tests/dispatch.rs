#![allow(clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::DomainKey;
use herald_dispatch::{
    ConfigLookup, ConfigLookupError, Connector, DispatchEngine, ErrorKind, Interrupt,
    RateLimitConfig, SendRequest, Transport, TransportConfig, TransportError,
};
use pretty_assertions::assert_eq;
use support::{RecordingTransport, fast_config, harness, harness_with, renderer};

#[tokio::test]
async fn test_send_delivers_rendered_message() {
    let h = harness(fast_config(), RecordingTransport::new());

    let result = h
        .engine
        .send(SendRequest::new("ap@vendor.test", "Payment sent", "payment").with_variable("amount", "42.00"))
        .await;

    assert!(result.success, "{result:?}");
    assert_eq!(result.message, "Sent to ap@vendor.test");
    assert_eq!(result.attempts, 1);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ap@vendor.test");
    assert_eq!(sent[0].subject, "Payment sent");
    assert_eq!(sent[0].from, "noreply@localhost");
    assert!(sent[0].body.starts_with("[payment] company=Herald"));
    assert!(sent[0].body.contains("amount=42.00"));

    let stats = h.engine.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_supplied_variables_override_defaults() {
    let h = harness(fast_config(), RecordingTransport::new());

    let result = h
        .engine
        .send(SendRequest::new("ap@vendor.test", "Hi", "welcome").with_variable("company_name", "Acme"))
        .await;

    assert!(result.success);
    assert!(h.transport.sent()[0].body.contains("company=Acme"));
}

#[tokio::test]
async fn test_invalid_request_short_circuits() {
    let h = harness(fast_config(), RecordingTransport::new());

    let handle = h.engine.send(SendRequest::new("   ", "Hi", "welcome"));
    assert!(handle.is_ready());

    let result = handle.await;
    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::Validation));
    assert_eq!(result.attempts, 0);

    assert_eq!(h.engine.dispatcher().gate().peak_in_flight(), 0);
    assert_eq!(h.engine.dispatcher().global_limit().stats().granted, 0);
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(h.engine.stats().failures(ErrorKind::Validation), 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries() {
    let mut config = fast_config();
    config.retry.max_attempts = 3;
    let h = harness(config, RecordingTransport::new().failing());

    let result = h.engine.send(SendRequest::new("ap@vendor.test", "Hi", "welcome")).await;

    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::Transport));
    assert_eq!(result.attempts, 3);
    assert_eq!(h.transport.attempts(), 3);
    assert!(result.message.starts_with("Failed after 3 attempts"), "{}", result.message);
}

#[tokio::test]
async fn test_permanent_rejection_is_not_retried() {
    let h = harness(
        fast_config(),
        RecordingTransport::new().rejecting("gone@vendor.test"),
    );

    let result = h.engine.send(SendRequest::new("gone@vendor.test", "Hi", "welcome")).await;

    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::Transport));
    assert_eq!(result.attempts, 1);
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test]
async fn test_render_failure_skips_transport() {
    let h = harness(fast_config(), RecordingTransport::new());

    let result = h.engine.send(SendRequest::new("ap@vendor.test", "Hi", "missing")).await;

    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::TemplateRender));
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(h.connector.connects(), 0);
    assert_eq!(h.engine.dispatcher().gate().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
async fn test_concurrency_never_exceeds_gate() {
    let mut config = fast_config();
    config.gate.permits = 3;
    let h = harness(
        config,
        RecordingTransport::new().with_delay(Duration::from_millis(20)),
    );

    let handles: Vec<_> = (0..20)
        .map(|i| {
            h.engine
                .send(SendRequest::new(format!("user{i}@vendor.test"), "Hi", "welcome"))
        })
        .collect();

    let results = futures_util::future::join_all(handles).await;

    assert!(results.iter().all(|r| r.success));
    assert_eq!(h.transport.attempts(), 20);
    assert_eq!(h.transport.peak_in_flight(), 3);
    assert_eq!(h.engine.dispatcher().gate().peak_in_flight(), 3);
    assert_eq!(h.engine.dispatcher().gate().in_flight(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
async fn test_global_rate_ceiling() {
    let mut config = fast_config();
    config.rate_limit = RateLimitConfig {
        permits_per_window: 1,
        window_ms: 60_000,
        max_wait_ms: 0,
    };
    config.rate_limit_retry.max_retries = 0;
    let h = harness(config, RecordingTransport::new());

    let first = h.engine.send(SendRequest::new("a@vendor.test", "Hi", "welcome")).await;
    let second = h.engine.send(SendRequest::new("b@vendor.test", "Hi", "welcome")).await;

    assert!(first.success);
    assert!(!second.success);
    assert_eq!(second.kind, Some(ErrorKind::RateLimitExceeded));
    assert_eq!(second.message, "Rate limit exceeded (global) after 0 retries");
    assert_eq!(h.transport.attempts(), 1);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
async fn test_rate_refusals_are_retried_up_to_ceiling() {
    let mut config = fast_config();
    config.rate_limit = RateLimitConfig {
        permits_per_window: 1,
        window_ms: 60_000,
        max_wait_ms: 0,
    };
    config.rate_limit_retry.max_retries = 2;
    let h = harness(config, RecordingTransport::new());

    assert!(h.engine.send(SendRequest::new("a@vendor.test", "Hi", "welcome")).await.success);
    let refused = h.engine.send(SendRequest::new("b@vendor.test", "Hi", "welcome")).await;

    assert_eq!(refused.message, "Rate limit exceeded (global) after 2 retries");
    assert_eq!(h.engine.dispatcher().global_limit().stats().refused, 3);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Time-based test not compatible with Miri")]
async fn test_domain_limit_only_affects_its_domain() {
    let mut config = fast_config();
    config.rate_limit_retry.max_retries = 0;
    config.domain_rate_limits.overrides.insert(
        "slow.test".to_string(),
        RateLimitConfig {
            permits_per_window: 1,
            window_ms: 60_000,
            max_wait_ms: 0,
        },
    );
    let h = harness(config, RecordingTransport::new());

    let first = h.engine.send(SendRequest::new("a@slow.test", "Hi", "welcome")).await;
    let second = h.engine.send(SendRequest::new("b@slow.test", "Hi", "welcome")).await;
    let other = h.engine.send(SendRequest::new("c@fast.test", "Hi", "welcome")).await;

    assert!(first.success);
    assert_eq!(second.kind, Some(ErrorKind::RateLimitExceeded));
    assert_eq!(second.message, "Rate limit exceeded (domain) after 0 retries");
    assert!(other.success);
    assert_eq!(h.transport.recipients(), vec!["a@slow.test", "c@fast.test"]);
}

#[tokio::test]
async fn test_domain_override_matches_any_case() {
    let mut config = fast_config();
    config.rate_limit_retry.max_retries = 0;
    config.domain_rate_limits.overrides.insert(
        "Bank.Example.com".to_string(),
        RateLimitConfig {
            permits_per_window: 1,
            window_ms: 60_000,
            max_wait_ms: 0,
        },
    );
    let h = harness(config, RecordingTransport::new());

    let first = h
        .engine
        .send(SendRequest::new("ap@bank.example.com", "Hi", "welcome"))
        .await;
    let second = h
        .engine
        .send(SendRequest::new("ar@BANK.example.com", "Hi", "welcome"))
        .await;

    assert!(first.success);
    assert_eq!(second.kind, Some(ErrorKind::RateLimitExceeded));
    assert_eq!(second.message, "Rate limit exceeded (domain) after 0 retries");
}

#[tokio::test(start_paused = true)]
async fn test_slot_timeout() {
    let mut config = fast_config();
    config.gate.permits = 1;
    config.gate.acquire_timeout_ms = 50;
    let h = harness(
        config,
        RecordingTransport::new().with_delay(Duration::from_secs(10)),
    );

    let slow = h.engine.send(SendRequest::new("a@vendor.test", "Hi", "welcome"));
    tokio::task::yield_now().await;
    let blocked = h.engine.send(SendRequest::new("b@vendor.test", "Hi", "welcome"));

    let blocked = blocked.await;
    assert_eq!(blocked.kind, Some(ErrorKind::ConcurrencySlotTimeout));
    assert_eq!(h.engine.dispatcher().gate().timeouts(), 1);

    assert!(slow.await.success);
}

#[tokio::test]
async fn test_interrupted_before_slot() {
    let (trigger, interrupt) = Interrupt::new();
    let h = harness_with(fast_config(), RecordingTransport::new(), interrupt);

    trigger.trigger();
    let result = h.engine.send(SendRequest::new("a@vendor.test", "Hi", "welcome")).await;

    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::Interrupted));
    assert_eq!(h.transport.attempts(), 0);
}

#[tokio::test]
async fn test_domain_config_is_used_when_present() {
    let mut config = fast_config();
    config.transports.insert(
        "Vendor.Test",
        TransportConfig {
            host: "mx.vendor.test".to_string(),
            from_address: "payments@herald.test".to_string(),
            ..TransportConfig::default()
        },
    );
    let h = harness(config, RecordingTransport::new());

    assert!(h.engine.send(SendRequest::new("ap@vendor.test", "Hi", "welcome")).await.success);
    assert!(h.engine.send(SendRequest::new("ap@other.test", "Hi", "welcome")).await.success);

    let sent = h.transport.sent();
    assert_eq!(sent[0].from, "payments@herald.test");
    assert_eq!(sent[1].from, "noreply@localhost");
}

struct Unavailable;

#[async_trait]
impl ConfigLookup for Unavailable {
    async fn resolve(&self, _domain: &DomainKey) -> Result<TransportConfig, ConfigLookupError> {
        Err(ConfigLookupError::Unavailable("database offline".to_string()))
    }
}

#[tokio::test]
async fn test_lookup_failure_is_reported() {
    let transport = Arc::new(RecordingTransport::new());
    let engine = DispatchEngine::builder(fast_config())
        .lookup(Arc::new(Unavailable))
        .connector(Arc::new(support::SharedConnector::new(transport.clone())))
        .renderer(renderer())
        .build()
        .unwrap();

    let result = engine.send(SendRequest::new("ap@vendor.test", "Hi", "welcome")).await;

    assert!(!result.success);
    assert_eq!(result.kind, Some(ErrorKind::ConfigLookup));
    assert_eq!(transport.attempts(), 0);
    assert_eq!(engine.cache().stats().load_failures, 1);
}

struct Refusing;

#[async_trait]
impl Connector for Refusing {
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Err(TransportError::Connection(format!("{} refused", config.address())))
    }
}

#[tokio::test]
async fn test_connector_failure_is_a_transport_error() {
    let engine = DispatchEngine::builder(fast_config())
        .connector(Arc::new(Refusing))
        .renderer(renderer())
        .build()
        .unwrap();

    let result = engine.send(SendRequest::new("ap@vendor.test", "Hi", "welcome")).await;

    assert_eq!(result.kind, Some(ErrorKind::Transport));
    assert_eq!(engine.cache().size(), 0);
}

#[test]
fn test_builder_requires_collaborators() {
    let error = DispatchEngine::builder(fast_config()).build().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Validation);

    let mut config = fast_config();
    config.gate.permits = 0;
    let error = DispatchEngine::builder(config)
        .renderer(renderer())
        .build()
        .unwrap_err();
    assert_eq!(error.to_string(), "Validation failed: gate.permits must be at least 1");
}
