use lbw_inspect::{AppConfig, AppError, LocalStore, RestBackend, SyncEngine};
use std::sync::Arc;

/// Headless sync runner
///
/// `lbw-inspect [config.toml] [service-id ...]` pulls the given services,
/// then drains the outbox in the background until Ctrl-C.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let mut args = std::env::args().skip(1);
    let config = AppConfig::discover(args.next().as_deref())?;
    let services: Vec<String> = args.collect();

    let backend = Arc::new(RestBackend::new(config.backend.clone())?);
    let store = Arc::new(LocalStore::open(config)?);
    let engine = Arc::new(SyncEngine::new(store.clone(), backend));

    engine.recover()?;
    for service_id in &services {
        match engine.pull_service(service_id).await {
            Ok(changed) => log::info!("Service {}: {} changes pulled", service_id, changed),
            Err(e) => log::warn!("Pull for service {} failed: {}", service_id, e),
        }
    }

    let dead = store.dead_letters()?;
    if !dead.is_empty() {
        log::warn!("{} queue items need attention", dead.len());
        for item in &dead {
            log::warn!(
                "  {} {} {}: {}",
                item.entity_type.as_str(),
                item.op.as_str(),
                item.target,
                item.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    let handle = engine.start();
    let mut status = engine.subscribe_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                log::debug!("Sync status: {:?}", current);
            }
        }
    }

    engine.stop();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            log::error!("Background sync task failed: {}", e);
        }
    }
    Ok(())
}
