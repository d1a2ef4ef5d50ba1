//! Error taxonomy of the forward manager.

use std::io;
use std::net::SocketAddr;

use common::ServiceError;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;

/// Errors produced while creating forwards or serving their connections.
///
/// `InvalidArgument`, `PortInUse`, `Bind` and a pre-flight `Resolution` fail
/// [`crate::ForwardManager::create_forward`]. `Resolution` and `Channel` raised
/// while serving a connection only end up in the rule's log; `ListenerFault`
/// moves the rule to `error` status.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Local port {port} is already in use by {resource}")]
    PortInUse { port: u16, resource: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("{0}")]
    ListenerFault(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ForwardError> for ServiceError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::InvalidArgument(_) => ServiceError::BadRequest(e.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}
