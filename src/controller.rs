// src/controller.rs
//! Controller assembly
//!
//! Wires the protocol server, lifecycle event loop, dispatcher and
//! reconciler together and owns their tasks.
//!
//! ```text
//!  triggers ──▶ Dispatcher ──▶ RunnerManager ──▶ SessionHub ──▶ runners
//!                                  ▲    ▲              ▲
//!            Reconciler ───────────┘    │              │
//!            ProtocolServer ── events ──┘   TCP frames ┘
//! ```

use crate::catalog::{ActionStore, KeyValueStore};
use crate::dispatch::{Dispatcher, JobRequest, JobResponse};
use crate::protocol::{ProtocolServer, SessionHub};
use crate::reconcile::{Reconciler, RejectionTracker};
use crate::runtime::orchestrator::{ControllerEndpoint, RunnerManager};
use crate::runtime::process_manager::RunnerLauncher;
use crate::utils::config::ControllerConfig;
use crate::utils::errors::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Controller {
    config: ControllerConfig,
    local_addr: SocketAddr,
    manager: Arc<RunnerManager>,
    dispatcher: Dispatcher,
    reconciler: Arc<Reconciler>,
    /// Stops the reconciler before runners are shut down
    reconcile_cancel: CancellationToken,
    /// Stops the protocol server and event loop last
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    reconcile_task: JoinHandle<()>,
}

impl Controller {
    /// Bind the protocol listener and start every background task
    pub async fn start(
        config: ControllerConfig,
        launcher: Arc<dyn RunnerLauncher>,
        actions: Arc<dyn ActionStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
        let local_addr = listener.local_addr()?;

        let hub = Arc::new(SessionHub::new(config.protocol.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        let endpoint = ControllerEndpoint {
            host: config.server.advertised_host().to_string(),
            port: local_addr.port(),
        };
        let manager = Arc::new(RunnerManager::new(
            Arc::clone(&hub),
            launcher,
            actions,
            exits_tx,
            endpoint,
            config.launcher.limits.clone(),
            config.dispatch.ready_wait(),
        ));

        let rejections = Arc::new(RejectionTracker::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&manager),
            Arc::clone(&rejections),
            Duration::from_secs(config.dispatch.default_timeout_secs),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&manager),
            rejections,
            config.reconcile.clone(),
            config.protocol.handshake_timeout(),
        ));

        let cancel = CancellationToken::new();
        let server = Arc::new(ProtocolServer::new(hub, store, events_tx));
        let tasks = vec![
            tokio::spawn(server.serve(listener, cancel.clone())),
            tokio::spawn(Arc::clone(&manager).run_events(events_rx, exits_rx, cancel.clone())),
        ];

        let reconcile_cancel = CancellationToken::new();
        let reconcile_task = tokio::spawn(Arc::clone(&reconciler).run(reconcile_cancel.clone()));

        info!(%local_addr, "Controller started");
        Ok(Self {
            config,
            local_addr,
            manager,
            dispatcher,
            reconciler,
            reconcile_cancel,
            cancel,
            tasks,
            reconcile_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<RunnerManager> {
        &self.manager
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run a request against the job's current action
    pub async fn dispatch(&self, job_id: &str, request: &JobRequest) -> JobResponse {
        self.dispatcher.dispatch(job_id, request).await
    }

    /// Stop reconciling, drain every runner, then stop the server
    pub async fn shutdown(self) {
        info!("Controller shutting down");
        self.reconcile_cancel.cancel();
        if let Err(e) = self.reconcile_task.await {
            warn!(error = %e, "Reconciler task failed");
        }

        self.manager
            .shutdown_all(self.config.reconcile.shutdown_grace())
            .await;

        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Controller task failed");
            }
        }
        info!("Controller stopped");
    }
}
