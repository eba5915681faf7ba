//! orange-mesh: peer-to-peer synchronization for orange-bot instances.
//!
//! Several bot processes form a small replicated cluster over mutual-TLS
//! message streams. The mesh gossips every message with per-source
//! dedup, elects a single controller by priority, hands each module to
//! exactly one live peer, detects death by heartbeat, and fans out
//! config-cache invalidations.
//!
//! The embedding bot supplies three collaborators: a [`ModuleRegistry`]
//! it owns, a [`ConfigCacheSink`] for expiry notices, and its identity
//! in the [`SyncConfig`]. Everything else lives behind [`SyncHandler`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use orange_mesh::{InMemoryRegistry, RunEnv, SyncConfig, SyncHandler, TlsIdentity};
//!
//! # async fn run(sink: Arc<dyn orange_mesh::ConfigCacheSink>) -> anyhow::Result<()> {
//! let config = SyncConfig::from_env("bot-1", "123456789", RunEnv::Prod)?;
//! let registry = Arc::new(InMemoryRegistry::new([("greeter".to_string(), true)]));
//! let tls = TlsIdentity::load(&config.cert_dir)?;
//! let handler = SyncHandler::new(config, registry, sink);
//! handler.start(tls).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod election;
mod error;
mod message;
mod peer;
mod registry;
mod sync;
mod tls;

#[cfg(test)]
mod testutil;

pub use config::{RunEnv, SyncConfig, Timings};
pub use error::{Result, SyncError};
pub use message::{Envelope, Hello, InstanceInfo, Message};
pub use registry::{
    CacheScope, ConfigCacheSink, InMemoryRegistry, LocalModule, ModuleDescriptor, ModuleRegistry,
};
pub use sync::{ModuleStatus, PeerStatus, SyncHandler, SyncStatus};
pub use tls::{TlsIdentity, SERVER_NAME};
