//! Collaborator contracts.
//!
//! The sync core reads module availability from, and writes module
//! ownership to, a registry owned by the rest of the bot; expired cache
//! notices go to a sink owned by the configuration layer. Both are traits
//! so the core can be driven against stubs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One module as advertised by a peer in `moduleInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    /// The advertising peer is capable of running this module.
    pub available: bool,
    /// The advertising peer is currently running this module.
    pub handling: bool,
}

/// One module as seen in the local registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalModule {
    pub name: String,
    pub available: bool,
    /// Instance name currently responsible, absent if unassigned.
    pub handler: Option<String>,
}

impl LocalModule {
    pub fn handled_by(&self, instance: &str) -> bool {
        self.handler.as_deref() == Some(instance)
    }
}

/// Which bucket family an `expireConfigCache` notice targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    User,
    Guild,
    Global,
}

impl std::fmt::Display for CacheScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheScope::User => write!(f, "user"),
            CacheScope::Guild => write!(f, "guild"),
            CacheScope::Global => write!(f, "global"),
        }
    }
}

/// The bot's module registry. The sync core is the only writer of the
/// handler field.
pub trait ModuleRegistry: Send + Sync {
    /// Snapshot of every local module.
    fn modules(&self) -> Vec<LocalModule>;

    /// Set or clear the handler of a module. Returns false if the module
    /// is unknown.
    fn set_handler(&self, module: &str, handler: Option<&str>) -> bool;
}

/// The configuration layer's cache, fed with expiry notices from peers.
pub trait ConfigCacheSink: Send + Sync {
    fn expire_cache(&self, config: &str, scope: CacheScope, id: &str);
}

/// Registry backed by a plain map, enough for embedding and for tests.
pub struct InMemoryRegistry {
    modules: Mutex<BTreeMap<String, LocalModule>>,
}

impl InMemoryRegistry {
    pub fn new(modules: impl IntoIterator<Item = (String, bool)>) -> Self {
        let map = modules
            .into_iter()
            .map(|(name, available)| {
                (
                    name.clone(),
                    LocalModule {
                        name,
                        available,
                        handler: None,
                    },
                )
            })
            .collect();
        InMemoryRegistry {
            modules: Mutex::new(map),
        }
    }

    pub fn handler(&self, module: &str) -> Option<String> {
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(module)
            .and_then(|m| m.handler.clone())
    }
}

impl ModuleRegistry for InMemoryRegistry {
    fn modules(&self) -> Vec<LocalModule> {
        self.modules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn set_handler(&self, module: &str, handler: Option<&str>) -> bool {
        let mut map = self.modules.lock().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(module) {
            Some(m) => {
                m.handler = handler.map(str::to_string);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_handler_round_trips() {
        let reg = InMemoryRegistry::new([("metrics".to_string(), true)]);
        assert!(reg.set_handler("metrics", Some("node-a")));
        assert_eq!(reg.handler("metrics").as_deref(), Some("node-a"));
        assert!(reg.set_handler("metrics", None));
        assert_eq!(reg.handler("metrics"), None);
    }

    #[test]
    fn unknown_module_is_reported() {
        let reg = InMemoryRegistry::new([]);
        assert!(!reg.set_handler("ghost", Some("node-a")));
    }

    #[test]
    fn handled_by_matches_exactly() {
        let module = LocalModule {
            name: "greeter".into(),
            available: true,
            handler: Some("node-a".into()),
        };
        assert!(module.handled_by("node-a"));
        assert!(!module.handled_by("node-b"));
    }

    #[test]
    fn scope_wire_form_is_lowercase() {
        assert_eq!(serde_json::to_string(&CacheScope::Guild).unwrap(), "\"guild\"");
    }
}
