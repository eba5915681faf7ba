//! Shared fixtures for the inline tests.

use std::sync::{Arc, Mutex};

use crate::config::{RunEnv, SyncConfig};
use crate::message::{self, Envelope, Message};
use crate::registry::{CacheScope, ConfigCacheSink, InMemoryRegistry};
use crate::sync::SyncHandler;

pub(crate) struct RecordingSink {
    calls: Mutex<Vec<(String, CacheScope, String)>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        RecordingSink {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, CacheScope, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ConfigCacheSink for RecordingSink {
    fn expire_cache(&self, config: &str, scope: CacheScope, id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((config.to_string(), scope, id.to_string()));
    }
}

/// A handler plus its collaborators, with the address cache parked in a
/// temp dir.
pub(crate) struct TestNode {
    pub(crate) handler: SyncHandler,
    pub(crate) registry: Arc<InMemoryRegistry>,
    pub(crate) sink: Arc<RecordingSink>,
    _tmp: tempfile::TempDir,
}

impl TestNode {
    pub(crate) fn new(name: &str) -> Self {
        Self::build(name, |_| {})
    }

    pub(crate) fn build(name: &str, tweak: impl FnOnce(&mut SyncConfig)) -> Self {
        Self::with_modules(name, [], tweak)
    }

    pub(crate) fn with_modules(
        name: &str,
        modules: impl IntoIterator<Item = (&'static str, bool)>,
        tweak: impl FnOnce(&mut SyncConfig),
    ) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = SyncConfig::new(name, "bot-user", RunEnv::Prod, 4000);
        config.cache_path = tmp.path().join("p2p-cache.json");
        config.priority = 1000;
        tweak(&mut config);
        let registry = Arc::new(InMemoryRegistry::new(
            modules.into_iter().map(|(n, a)| (n.to_string(), a)),
        ));
        let sink = Arc::new(RecordingSink::new());
        let handler = SyncHandler::new(config, registry.clone(), sink.clone());
        TestNode {
            handler,
            registry,
            sink,
            _tmp: tmp,
        }
    }
}

pub(crate) fn frame(source: &str, id: u64, message: Message) -> Vec<u8> {
    message::encode(
        &Envelope {
            source: source.to_string(),
            id,
        },
        &message,
    )
    .expect("encode")
}

pub(crate) fn expire_frame(source: &str, id: u64, config: &str, key: &str) -> Vec<u8> {
    frame(
        source,
        id,
        Message::ExpireConfigCache {
            config: config.to_string(),
            scope: CacheScope::Guild,
            id: key.to_string(),
        },
    )
}
