//! Common types, protocol definitions, and errors shared across `podfwd` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
pub use protocol::{ForwardEvent, ForwardRule, ForwardSpec, ForwardStatus, ResourceKind};
