use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::bulk_query::LeaseQueryHandler;
use crate::config::Config;
use crate::error::Result;
use crate::intake::{LeaseEvent, LeaseUpdater};
use crate::lease::Leases;
use crate::queue::QueueManager;
use crate::tcp::{ConnectionFilter, Listener, ListenerOptions};

/// How often `run` purges expired leases.
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Composition root: owns the lease store, the packet-queue registry, the
/// lease-update intake and the bulk lease-query listener.
pub struct LeaseQueryServer {
    config: Arc<Config>,
    leases: Arc<Leases>,
    queues: Arc<QueueManager<LeaseEvent>>,
    updater: LeaseUpdater,
    listener: Listener,
}

impl LeaseQueryServer {
    /// Builds the server from a validated configuration.
    ///
    /// Loads the lease file and applies the `packet_queue` section. Nothing
    /// is bound until [`start`](Self::start) or [`run`](Self::run).
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let leases = Arc::new(Leases::new(config.lease_database.clone()).await?);

        let queues = Arc::new(QueueManager::new());
        if let Some(params) = &config.packet_queue {
            queues.configure(params)?;
        }
        let updater = LeaseUpdater::new(Arc::clone(&leases), Arc::clone(&queues));

        let handler = Arc::new(LeaseQueryHandler::new(Arc::clone(&leases)));
        let listener = Listener::new(ListenerOptions::from(&config.listener), handler)?;

        info!(
            "Lease query server configured for {}:{}",
            config.listener.address, config.listener.port
        );
        info!(
            "Extended info tables {}",
            if config.lease_database.extended_info_tables {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(Self {
            config,
            leases,
            queues,
            updater,
            listener,
        })
    }

    /// Restricts which peers may connect.
    pub fn with_filter(mut self, filter: ConnectionFilter) -> Self {
        self.listener = self.listener.with_filter(filter);
        self
    }

    /// Starts the lease-update worker and the listener, and returns the
    /// listener's bound address.
    pub fn start(&self) -> Result<SocketAddr> {
        self.updater.start();
        self.listener.start()
    }

    /// Hands a lease change to the update worker.
    ///
    /// Events submitted before [`start`](Self::start) are applied once the
    /// worker runs. Returns `false` after [`stop`](Self::stop).
    pub fn submit(&self, event: LeaseEvent) -> bool {
        self.updater.submit(event)
    }

    /// Starts the listener, then purges expired leases periodically.
    ///
    /// Never returns unless the listener fails to start.
    pub async fn run(&self) -> Result<()> {
        self.start()?;
        info!("Lease query server ready");

        let mut cleanup = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        cleanup.tick().await;
        loop {
            cleanup.tick().await;
            let count = self.leases.cleanup_expired_leases().await;
            if count > 0 {
                info!("Removed {} expired lease(s)", count);
            }
        }
    }

    /// Stops the listener, every connection and the update worker, then
    /// saves the leases.
    pub async fn stop(&self) -> Result<()> {
        self.listener.stop();
        self.updater.stop().await;
        self.leases.save().await
    }

    pub async fn save_leases(&self) -> Result<()> {
        self.leases.save().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn leases(&self) -> &Arc<Leases> {
        &self.leases
    }

    pub fn queues(&self) -> &QueueManager<LeaseEvent> {
        &self.queues
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }
}
