use std::sync::Arc;

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

use crate::{
    config::Config,
    dmon::DmonSampler,
    host::HostSampler,
    identity::load_identity,
    nvidia::Commands,
    processes::ProcessSampler,
    store::HistoryStore,
};

/// The running acquisition pipeline: identity query, dmon, process and host samplers.
pub struct Monitor {
    store: Arc<HistoryStore>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Monitor {
    /// Spawns every sampler onto the current runtime.
    pub fn start(config: &Config, commands: Commands) -> Self {
        let store = Arc::new(HistoryStore::new(config.history_size));

        // This token and tracker will be used to handle graceful shutdown
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        {
            let store = store.clone();
            let token = token.clone();
            let command = commands.identity;
            let limit = config.query_timeout;

            tracker.spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {},
                    _ = load_identity(&command, limit, &store) => {},
                }
            });
        }

        {
            let sampler = DmonSampler::new(
                commands.dmon,
                store.clone(),
                config.restart.clone(),
                config.shutdown_grace,
            );
            let token = token.clone();

            tracker.spawn(async move {
                if let Err(err) = sampler.run(token).await {
                    error!("{err}");
                }
            });
        }

        {
            let sampler = ProcessSampler::new(
                commands.processes,
                store.clone(),
                config.process_interval,
                config.query_timeout,
            );
            let token = token.clone();

            tracker.spawn(sampler.run(token));
        }

        {
            let sampler = HostSampler::new(store.clone(), config.dmon_interval);
            tracker.spawn(sampler.run(token.clone()));
        }

        Self {
            store,
            token,
            tracker,
        }
    }

    pub fn store(&self) -> Arc<HistoryStore> {
        self.store.clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels all samplers and waits until their children are gone.
    pub async fn shutdown(self) {
        info!("Stopping samplers");
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All samplers stopped");
    }
}
