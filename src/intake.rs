//! Lease-update intake.
//!
//! Producers hand [`LeaseEvent`]s to a [`LeaseUpdater`] without waiting on
//! the store. With a packet queue configured, events are buffered there (a
//! full ring queue sheds its oldest event) and a drain job is posted to the
//! worker; without one, the event is posted to the worker directly. A single
//! blocking worker applies events to [`Leases`] in arrival order.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lease::{Lease, Leases};
use crate::queue::{QueueManager, WorkQueue};

/// A change to apply to the lease store.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseEvent {
    Add(Lease),
    Update(Lease),
    Delete(Lease),
}

enum Job {
    Apply(LeaseEvent),
    /// Apply everything buffered in the packet queue.
    Drain,
}

/// Applies submitted [`LeaseEvent`]s on a blocking worker.
pub struct LeaseUpdater {
    leases: Arc<Leases>,
    queues: Arc<QueueManager<LeaseEvent>>,
    work: Arc<WorkQueue<Job>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseUpdater {
    pub fn new(leases: Arc<Leases>, queues: Arc<QueueManager<LeaseEvent>>) -> Self {
        Self {
            leases,
            queues,
            work: Arc::new(WorkQueue::new()),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker on the current runtime's blocking pool.
    ///
    /// Does nothing if the worker is already running.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        self.work.enable();
        let runtime = Handle::current();
        let leases = Arc::clone(&self.leases);
        let queues = Arc::clone(&self.queues);
        let work = Arc::clone(&self.work);
        *worker = Some(tokio::task::spawn_blocking(move || {
            work_loop(&runtime, &leases, &queues, &work);
        }));
    }

    /// Queues an event for the worker.
    ///
    /// Returns `false` if the updater is stopped and the event was dropped.
    pub fn submit(&self, event: LeaseEvent) -> bool {
        if !self.work.is_enabled() {
            return false;
        }
        match self.queues.queue() {
            Some(queue) => {
                queue.enqueue(event);
                self.work.push(Job::Drain)
            }
            None => self.work.push(Job::Apply(event)),
        }
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Events not yet applied are discarded.
    pub async fn stop(&self) {
        self.work.disable();
        self.work.clear();
        if let Some(queue) = self.queues.queue() {
            queue.clear();
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(error) = worker.await
        {
            warn!("Lease update worker failed: {}", error);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

fn work_loop(
    runtime: &Handle,
    leases: &Leases,
    queues: &QueueManager<LeaseEvent>,
    work: &WorkQueue<Job>,
) {
    debug!("Lease update worker started");
    while let Some(job) = work.pop() {
        match job {
            Job::Apply(event) => runtime.block_on(apply(leases, event)),
            Job::Drain => {
                let Some(queue) = queues.queue() else {
                    continue;
                };
                while work.is_enabled()
                    && let Some(event) = queue.dequeue()
                {
                    runtime.block_on(apply(leases, event));
                }
            }
        }
    }
    debug!("Lease update worker stopped");
}

async fn apply(leases: &Leases, event: LeaseEvent) {
    let result = match event {
        LeaseEvent::Add(mut lease) => leases.add_lease(&mut lease).await,
        LeaseEvent::Update(mut lease) => leases.update_lease(&mut lease).await,
        LeaseEvent::Delete(mut lease) => leases.delete_lease(&mut lease).await.map(|_| ()),
    };
    if let Err(error) = result {
        warn!("Lease event rejected: {}", error);
    }
}
