//! Outbound notification dispatch
//!
//! Turns "send this template to this recipient" into a delivered message
//! while bounding everything that could grow without limit:
//!
//! - [`TransportCache`]: per-domain transport handles with a size bound,
//!   expiry and refresh-ahead
//! - [`RateLimiter`] / [`RateLimiterRegistry`]: global and per-domain
//!   fixed-window limits
//! - [`ConcurrencyGate`]: a cap on sends in flight
//! - [`RetryExecutor`]: bounded exponential backoff
//! - [`Dispatcher`]: the per-send state machine
//! - [`BatchCoordinator`]: bulk sends in fixed-size batches
//!
//! [`DispatchEngine`] wires them together.

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gate;
pub mod interrupt;
pub mod maintenance;
pub mod pool;
pub mod rate_limiter;
pub mod render;
pub mod retry;
pub mod transport;

pub use batch::{BatchConfig, BatchCoordinator, BulkHandle, BulkReport, unique_recipients};
pub use config::DispatchConfig;
pub use dispatcher::{
    DispatchState, DispatchStats, Dispatcher, RateLimitRetry, SendHandle, SendRequest, SendResult,
};
pub use engine::{DispatchEngine, EngineBuilder};
pub use error::{
    ConfigLookupError, DispatchError, ErrorKind, Interrupted, LimitScope, RenderError,
    TransportError,
};
pub use gate::{ConcurrencyGate, GateConfig, SlotPermit};
pub use interrupt::{Interrupt, InterruptTrigger};
pub use maintenance::{CacheMaintenance, CleanupReport, MaintenanceConfig};
pub use pool::{PoolConfig, PoolError, Task, WorkerPool};
pub use rate_limiter::{DomainRateLimits, RateLimitConfig, RateLimitStats, RateLimiter, RateLimiterRegistry};
pub use render::{DefaultVariables, Renderer, Variables};
pub use retry::{Attempted, RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use transport::{
    CacheConfig, CacheStats, CachedTransport, ConfigLookup, Connector, LayeredLookup,
    OutboundMessage, PreloadReport, Protocol, StaticTransports, Transport, TransportCache,
    TransportConfig,
};
