/// Run one mesh node against a stub registry and print its status.
///
/// Usage:
///   P2P_SYNC_PORT=4000 cargo run --example solo -- bot-1
///   P2P_SYNC_PORT=4001 P2P_PEERS=127.0.0.1:4000 cargo run --example solo -- bot-2
///
/// Expects the five PEM files under ./certs (override with CERT_DIR).

use std::sync::Arc;

use orange_mesh::{
    CacheScope, ConfigCacheSink, InMemoryRegistry, RunEnv, SyncConfig, SyncHandler, TlsIdentity,
};

struct PrintingSink;

impl ConfigCacheSink for PrintingSink {
    fn expire_cache(&self, config: &str, scope: CacheScope, id: &str) {
        eprintln!("cache expired: {config}/{scope}/{id}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let instance = std::env::args().nth(1).unwrap_or_else(|| "bot-1".to_string());
    let mut config = SyncConfig::from_env(instance, "000000000000000000", RunEnv::Dev)?;
    if let Ok(dir) = std::env::var("CERT_DIR") {
        config.cert_dir = dir.into();
    }
    let tls = TlsIdentity::load(&config.cert_dir)?;

    let registry = Arc::new(InMemoryRegistry::new([
        ("greeter".to_string(), true),
        ("metrics".to_string(), true),
    ]));
    let handler = SyncHandler::new(config, registry, Arc::new(PrintingSink));
    handler.start(tls).await?;

    let mut changes = handler.changes();
    loop {
        tokio::select! {
            _ = changes.changed() => {
                let status = handler.status().await;
                eprintln!(
                    "controller={:?} peers={:?}",
                    status.controller,
                    status
                        .peers
                        .iter()
                        .map(|p| format!("{}{}", p.name, if p.alive { "" } else { " (dead)" }))
                        .collect::<Vec<_>>()
                );
                for module in &status.modules {
                    eprintln!("  module {} handler={:?}", module.name, module.handler);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
        }
    }
    Ok(())
}
