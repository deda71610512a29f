// Host-service delegation
//
// Operations that run on another service (GPU trainer, bulk data loader)
// register a session proxy here; the registry then refreshes them through
// the same pull contract as in-process work.

mod client;
mod proxy;

pub use client::{HostServiceClient, SessionStarted};
pub use proxy::RemoteSessionProxy;
