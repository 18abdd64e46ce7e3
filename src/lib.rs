pub mod agent;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod executor;
pub mod retry;
pub mod store;
pub mod worktree;

use std::sync::Arc;

use tokio::sync::watch;

use agent::AdapterRegistry;
use config::DaemonConfig;
use control::ControlSurface;
use events::hooks::HookRunner;
use events::webhooks::WebhookSink;
use events::EventBus;
use executor::Executor;
use store::Store;
use worktree::WorktreeProvisioner;

/// Shared application state handed to every collaborator surface and
/// background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub executor: Arc<Executor>,
    pub control: ControlSurface,
    pub started_at: std::time::Instant,
}

/// Wire the daemon together from an explicit config and the root shutdown
/// signal. The executor is constructed but not yet running — the caller
/// spawns [`Executor::run`].
pub async fn build_context(
    config: DaemonConfig,
    shutdown: watch::Receiver<bool>,
) -> error::Result<AppContext> {
    let store = Arc::new(Store::open(&config.data_dir).await?);

    let webhooks = WebhookSink::new(store.event_webhooks().await.unwrap_or_default());
    let hooks = HookRunner::new(config.hooks_dir(), config.hook_item_events);
    let bus = EventBus::new(Some(hooks), webhooks, shutdown.clone());

    let mut registry = AdapterRegistry::standard(&config.default_executor);
    registry.register(Arc::new(agent::mock::MockAdapter::new()));
    let registry = Arc::new(registry);

    let provisioner = Arc::new(WorktreeProvisioner::new(&config.data_dir));
    let executor = Executor::new(
        store.clone(),
        bus.clone(),
        registry,
        provisioner,
        shutdown,
        config.max_workers,
        config.idle_suspend_timeout,
        config.data_dir.clone(),
    );

    let control = ControlSurface::new(store.clone(), bus.clone(), executor.clone());

    Ok(AppContext {
        config: Arc::new(config),
        store,
        bus,
        executor,
        control,
        started_at: std::time::Instant::now(),
    })
}
