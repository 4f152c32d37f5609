//! Wires the dispatcher, reaper and retention cleaner together and owns
//! their shutdown.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::dispatcher::Dispatcher;
use crate::publisher::StatusPublisher;
use crate::reaper::LeaseReaper;
use crate::registry::HandlerRegistry;
use crate::retention::RetentionCleaner;
use crate::store::JobStore;

/// Identifier for this process's workers, used as the `locked_by` prefix
pub fn node_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}

pub struct JobRuntime {
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
    publisher: StatusPublisher,
    config: JobsConfig,
    node_id: String,
}

impl JobRuntime {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        publisher: StatusPublisher,
        config: JobsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            config,
            node_id: node_id(),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Spawn every background task
    pub fn start(self) -> RuntimeHandle {
        let shutdown = CancellationToken::new();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if self.registry.is_empty() {
            tracing::warn!("No job handlers registered; dispatcher will stay idle");
        }
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            self.registry,
            self.publisher.clone(),
            &self.node_id,
            &self.config,
        );
        tasks.push(("dispatcher", tokio::spawn(dispatcher.run(shutdown.child_token()))));

        match LeaseReaper::new(
            Arc::clone(&self.store),
            self.publisher.clone(),
            self.config.running_timeout,
            self.config.reaper_interval,
        ) {
            Some(reaper) => tasks.push(("reaper", tokio::spawn(reaper.run(shutdown.child_token())))),
            None => tracing::info!("Running-job timeout is zero; lease reaper disabled"),
        }

        match RetentionCleaner::new(
            Arc::clone(&self.store),
            self.config.retention,
            self.config.cleanup_interval,
        ) {
            Some(cleaner) => {
                tasks.push(("retention", tokio::spawn(cleaner.run(shutdown.child_token()))))
            }
            None => tracing::info!("Job retention is zero; terminal jobs are kept"),
        }

        tracing::info!(node_id = %self.node_id, "Job runtime started");
        RuntimeHandle { shutdown, tasks }
    }
}

/// Handle to the running background tasks
#[derive(Debug)]
pub struct RuntimeHandle {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RuntimeHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, wait for running jobs and timers to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(error) = result {
                tracing::warn!(task = name, %error, "Background task panicked");
            }
        }
        tracing::info!("Job runtime stopped");
    }
}
