//! Shared building blocks for herald
//!
//! - [`DomainKey`]: the normalised destination-domain identifier
//! - [`logging`]: subscriber setup and the `internal!`/`outgoing!` macros
//! - [`Signal`]: process lifecycle notifications

pub mod domain;
pub mod logging;

pub use domain::DomainKey;
pub use tracing;

/// Lifecycle notifications broadcast by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
