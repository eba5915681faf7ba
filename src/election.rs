//! Controller election and module assignment.
//!
//! The live peer with the lowest priority is the controller, and the
//! controller owns assignment. There is no consensus here: assignments
//! are advisory, conflicts resolve by priority, and brief double
//! handling is tolerated while the mesh converges.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::message::{InstanceInfo, Message};
use crate::peer::{Peer, UNKNOWN_PRIORITY};
use crate::registry::ModuleDescriptor;
use crate::sync::SyncHandler;

enum Election {
    Unchanged,
    /// We were controller; a more senior peer appeared.
    Announce(String),
    /// We outrank the candidate, take over ourselves.
    Assume,
    Adopt(String),
}

impl SyncHandler {
    pub(crate) async fn on_instance_info(&self, source: &str, info: InstanceInfo) -> Result<()> {
        let outcome = {
            let mut state = self.state.lock().await;
            {
                let peer = state.peers.get_or_insert(source);
                peer.priority = info.priority;
                peer.last_seen = Some(Instant::now());
                peer.known_dead = false;
                if let Some(address) = &info.address {
                    peer.address = Some(address.clone());
                }
            }
            if let Some(address) = &info.address {
                if let Err(e) = state.cache.upsert(source, address) {
                    warn!("address cache: {e}");
                }
            }

            let me = self.config.instance.as_str();
            let current = state.controller.clone();
            let current_priority = match current.as_deref() {
                Some(name) if name == me => Some(self.config.priority),
                Some(name) => state.peers.get(name).map(|p| p.priority),
                None => None,
            };
            let beats_current = match current_priority {
                Some(priority) => info.priority < priority,
                None => true,
            };
            if !beats_current {
                Election::Unchanged
            } else if current.as_deref() == Some(me) {
                state.controller = Some(source.to_string());
                Election::Announce(source.to_string())
            } else if self.config.priority < info.priority {
                Election::Assume
            } else {
                state.controller = Some(source.to_string());
                Election::Adopt(source.to_string())
            }
        };

        match outcome {
            Election::Unchanged => {}
            Election::Announce(name) => {
                info!("handing control to {name}");
                self.notify_change();
                self.broadcast(Message::ControlSwitch { controller: name }).await;
            }
            Election::Assume => self.assume_control().await,
            Election::Adopt(name) => {
                debug!("controller is {name}");
                self.notify_change();
            }
        }

        // A peer introduced itself; answer with our module list.
        self.broadcast(self.module_info_message()).await;
        Ok(())
    }

    pub(crate) async fn on_control_switch(&self, source: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let me = self.config.instance.as_str();
        if name != me && !state.peers.contains(name) {
            return Err(SyncError::UnknownPeer(name.to_string()));
        }
        let target_priority = if name == me {
            self.config.priority
        } else {
            state
                .peers
                .get(name)
                .map(|p| p.priority)
                .unwrap_or(UNKNOWN_PRIORITY)
        };
        if self.config.priority < target_priority {
            return Err(SyncError::RankParadox(name.to_string()));
        }
        if state.controller.as_deref() != Some(name) {
            state.controller = Some(name.to_string());
            info!("controller switched to {name} (announced by {source})");
            drop(state);
            self.notify_change();
        }
        Ok(())
    }

    /// Take control and tell everyone.
    pub(crate) async fn assume_control(&self) {
        {
            let mut state = self.state.lock().await;
            if state.controller.as_deref() == Some(self.config.instance.as_str()) {
                return;
            }
            state.controller = Some(self.config.instance.clone());
        }
        info!("assuming control of the mesh");
        self.notify_change();
        self.broadcast(Message::ControlSwitch {
            controller: self.config.instance.clone(),
        })
        .await;
    }

    /// Non-controller tick half: claim control when nobody senior is left.
    pub(crate) async fn election_check(&self) {
        let should_assume = {
            let state = self.state.lock().await;
            let now = Instant::now();
            let timings = &self.config.timings;
            let controller_live = match state.controller.as_deref() {
                Some(name) if name == self.config.instance => true,
                Some(name) => state
                    .peers
                    .get(name)
                    .map(|p| p.alive(now, timings))
                    .unwrap_or(false),
                None => false,
            };
            if controller_live {
                false
            } else {
                !state
                    .peers
                    .live_remote(now, timings)
                    .iter()
                    .any(|p| p.priority < self.config.priority)
            }
        };
        if should_assume {
            self.assume_control().await;
        }
    }

    // ── Module assignment ──

    pub(crate) async fn on_module_info(
        &self,
        source: &str,
        modules: Vec<ModuleDescriptor>,
    ) -> Result<()> {
        enum Conflict {
            Yield(String),
            Reclaim(String),
            Request(String),
            Cleared(String),
        }

        let actions = {
            let mut state = self.state.lock().await;
            let me = self.config.instance.as_str();
            let peer_priority = state
                .peers
                .get(source)
                .map(|p| p.priority)
                .unwrap_or(UNKNOWN_PRIORITY);
            let i_am_controller = state.controller.as_deref() == Some(me);
            let locals = self.registry.modules();

            let mut actions = Vec::new();
            for descriptor in &modules {
                let Some(local) = locals.iter().find(|m| m.name == descriptor.name) else {
                    continue;
                };
                if descriptor.handling {
                    if local.handled_by(me) {
                        // Both sides claim it; the junior side yields.
                        if self.config.priority > peer_priority {
                            actions.push(Conflict::Yield(descriptor.name.clone()));
                        } else if i_am_controller {
                            actions.push(Conflict::Reclaim(descriptor.name.clone()));
                        } else {
                            actions.push(Conflict::Request(descriptor.name.clone()));
                        }
                    }
                } else if local.handler.as_deref() == Some(source) {
                    actions.push(Conflict::Cleared(descriptor.name.clone()));
                }
            }
            state.peers.get_or_insert(source).modules = modules;
            actions
        };

        for action in actions {
            match action {
                Conflict::Yield(module) => {
                    info!("yielding module {module} to {source}");
                    self.registry.set_handler(&module, None);
                }
                Conflict::Reclaim(module) => {
                    info!("also handled by {source}, reclaiming module {module}");
                    self.broadcast(Message::AssignModule {
                        peer: self.config.instance.clone(),
                        module,
                    })
                    .await;
                }
                Conflict::Request(module) => {
                    info!("also handled by {source}, requesting module {module} back");
                    self.broadcast(Message::RequestModule { module }).await;
                }
                Conflict::Cleared(module) => {
                    debug!("{source} stopped handling {module}");
                    self.registry.set_handler(&module, None);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn on_request_module(&self, source: &str, module: &str) -> Result<()> {
        if !self.is_controller().await {
            return Ok(());
        }
        if !self.registry.modules().iter().any(|m| m.name == module) {
            return Err(SyncError::UnknownModule(module.to_string()));
        }
        self.registry.set_handler(module, None);
        {
            let mut state = self.state.lock().await;
            set_claim(state.peers.get_or_insert(source), module, true);
        }
        info!("assigning module {module} to {source} on request");
        self.broadcast(Message::AssignModule {
            peer: source.to_string(),
            module: module.to_string(),
        })
        .await;
        Ok(())
    }

    pub(crate) async fn on_assign_module(&self, assignee: &str, module: &str) -> Result<()> {
        let me = self.config.instance.as_str();
        let locals = self.registry.modules();
        let Some(local) = locals.iter().find(|m| m.name == module) else {
            return Err(SyncError::UnknownModule(module.to_string()));
        };

        if assignee == me {
            info!("module {module} assigned to us");
            self.registry.set_handler(module, Some(me));
            // Advertise right away so the controller sees it covered.
            self.broadcast(self.module_info_message()).await;
        } else {
            if local.handled_by(me) {
                info!("module {module} reassigned to {assignee}, stopping");
                self.registry.set_handler(module, Some(assignee));
            }
            let mut state = self.state.lock().await;
            set_claim(state.peers.get_or_insert(assignee), module, true);
        }
        Ok(())
    }

    /// Controller tick half: every module ends up with exactly one
    /// handler among the live peers, preferring ourselves when capable.
    pub(crate) async fn reconcile_modules(&self) {
        let me = self.config.instance.as_str();
        let live: Vec<(String, Vec<ModuleDescriptor>)> = {
            let state = self.state.lock().await;
            let now = Instant::now();
            state
                .peers
                .live_remote(now, &self.config.timings)
                .into_iter()
                .map(|p| (p.name.clone(), p.modules.clone()))
                .collect()
        };

        let mut assigns = Vec::new();
        let mut took_any = false;
        for local in self.registry.modules() {
            let handled_by_live = live.iter().any(|(_, modules)| {
                modules.iter().any(|d| d.name == local.name && d.handling)
            });
            if local.handled_by(me) || handled_by_live {
                continue;
            }
            if local.available {
                info!("module {} unhandled, taking it", local.name);
                self.registry.set_handler(&local.name, Some(me));
                took_any = true;
            } else if let Some((peer, _)) = live.iter().find(|(_, modules)| {
                modules.iter().any(|d| d.name == local.name && d.available)
            }) {
                info!("module {} unhandled, assigning to {peer}", local.name);
                self.registry.set_handler(&local.name, None);
                assigns.push((peer.clone(), local.name.clone()));
            } else if local.handler.is_some() {
                warn!("module {} has no capable live peer", local.name);
                self.registry.set_handler(&local.name, None);
            }
        }

        for (peer, module) in assigns {
            {
                let mut state = self.state.lock().await;
                set_claim(state.peers.get_or_insert(&peer), &module, true);
            }
            self.broadcast(Message::AssignModule { peer, module }).await;
        }
        if took_any {
            self.broadcast(self.module_info_message()).await;
        }
    }

    /// A peer died. If we are the controller, its modules get new homes.
    pub(crate) async fn dead_peer_fallout(&self, name: &str, handled: Vec<String>) {
        if !self.is_controller().await || handled.is_empty() {
            return;
        }
        info!("reassigning {} module(s) from dead peer {name}", handled.len());
        {
            let mut state = self.state.lock().await;
            if let Some(peer) = state.peers.get_mut(name) {
                for descriptor in &mut peer.modules {
                    descriptor.handling = false;
                }
            }
        }
        self.reconcile_modules().await;
    }

    /// Alone in the world: claim everything we can run and take control.
    pub(crate) async fn solo_fallback(&self) {
        warn!("no peers reachable, claiming every available module");
        let me = self.config.instance.as_str();
        for module in self.registry.modules() {
            if module.available {
                self.registry.set_handler(&module.name, Some(me));
            }
        }
        self.assume_control().await;
    }
}

fn set_claim(peer: &mut Peer, module: &str, handling: bool) {
    match peer.modules.iter_mut().find(|d| d.name == module) {
        Some(descriptor) => descriptor.handling = handling,
        None => peer.modules.push(ModuleDescriptor {
            name: module.to_string(),
            available: true,
            handling,
        }),
    }
}
