//! Packet queues and the registry that builds them from configuration.
//!
//! A [`QueueManager`] is owned by the server and holds named factories
//! (the built-in one is `"ring"`) plus the currently configured queue.
//! [`WorkQueue`] is the closable hand-off queue used between a producer and
//! blocking worker threads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Queue type name of the built-in ring queue.
pub const RING_QUEUE_TYPE: &str = "ring";

/// Capacity of the queue a fresh [`QueueManager`] starts with.
pub const DEFAULT_QUEUE_CAPACITY: usize = 500;

/// Operations every packet queue variant supports.
pub trait PacketQueue<T>: Send + Sync {
    /// Name of the factory that built this queue.
    fn queue_type(&self) -> &str;

    fn enqueue(&self, item: T);

    fn dequeue(&self) -> Option<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn clear(&self);
}

/// Bounded FIFO that discards the oldest item when full.
#[derive(Debug)]
pub struct RingQueue<T> {
    queue_type: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T> RingQueue<T> {
    /// # Errors
    ///
    /// Returns [`Error::InvalidQueueParameter`] for a zero capacity.
    pub fn new(queue_type: impl Into<String>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidQueueParameter(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            queue_type: queue_type.into(),
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }
}

impl<T: Send> PacketQueue<T> for RingQueue<T> {
    fn queue_type(&self) -> &str {
        &self.queue_type
    }

    fn enqueue(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    fn dequeue(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Builds a queue from its configuration map.
pub type QueueFactory<T> = Arc<dyn Fn(&Value) -> Result<Arc<dyn PacketQueue<T>>> + Send + Sync>;

fn required_capacity(params: &Value) -> Result<usize> {
    let capacity = params.get("capacity").ok_or_else(|| {
        Error::InvalidQueueParameter("'capacity' parameter is missing".to_string())
    })?;
    capacity
        .as_u64()
        .filter(|capacity| *capacity > 0)
        .map(|capacity| capacity as usize)
        .ok_or_else(|| {
            Error::InvalidQueueParameter(format!(
                "'capacity' must be a positive integer, got {}",
                capacity
            ))
        })
}

fn ring_factory<T: Send + 'static>() -> QueueFactory<T> {
    Arc::new(|params: &Value| {
        let capacity = required_capacity(params)?;
        let queue: Arc<dyn PacketQueue<T>> = Arc::new(RingQueue::new(RING_QUEUE_TYPE, capacity)?);
        Ok(queue)
    })
}

/// Registry of queue factories plus the queue currently in use.
pub struct QueueManager<T> {
    factories: Mutex<HashMap<String, QueueFactory<T>>>,
    queue: Mutex<Option<Arc<dyn PacketQueue<T>>>>,
}

impl<T: Send + 'static> QueueManager<T> {
    /// Creates a manager with the `"ring"` factory registered and a default
    /// ring queue in place.
    pub fn new() -> Self {
        let mut factories = HashMap::new();
        factories.insert(RING_QUEUE_TYPE.to_string(), ring_factory::<T>());

        let default: Option<Arc<dyn PacketQueue<T>>> =
            RingQueue::new(RING_QUEUE_TYPE, DEFAULT_QUEUE_CAPACITY)
                .ok()
                .map(|queue| Arc::new(queue) as Arc<dyn PacketQueue<T>>);

        Self {
            factories: Mutex::new(factories),
            queue: Mutex::new(default),
        }
    }

    /// Returns `false` if a factory with this name is already registered.
    pub fn register_factory(&self, queue_type: &str, factory: QueueFactory<T>) -> bool {
        let mut factories = self.factories.lock();
        if factories.contains_key(queue_type) {
            return false;
        }
        factories.insert(queue_type.to_string(), factory);
        debug!("Registered packet queue factory {}", queue_type);
        true
    }

    /// Removes a factory.
    ///
    /// Returns `Ok(false)` if no factory has this name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidQueueParameter`] if the current queue was
    /// built by this factory.
    pub fn unregister_factory(&self, queue_type: &str) -> Result<bool> {
        let mut factories = self.factories.lock();
        if !factories.contains_key(queue_type) {
            return Ok(false);
        }

        if let Some(queue) = self.queue.lock().as_ref()
            && queue.queue_type() == queue_type
        {
            return Err(Error::InvalidQueueParameter(format!(
                "queue type {} is in use",
                queue_type
            )));
        }

        factories.remove(queue_type);
        Ok(true)
    }

    pub fn has_factory(&self, queue_type: &str) -> bool {
        self.factories.lock().contains_key(queue_type)
    }

    /// Replaces the current queue with one built from `params`.
    ///
    /// `params` must be a map with a string `"queue-type"`; the factory
    /// validates the rest. On failure the previous queue stays in place.
    pub fn create_queue(&self, params: &Value) -> Result<()> {
        if !params.is_object() {
            return Err(Error::InvalidQueueParameter(
                "queue parameters must be a map".to_string(),
            ));
        }

        let queue_type = params
            .get("queue-type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::InvalidQueueParameter("'queue-type' parameter is missing".to_string())
            })?;

        let factory = self
            .factories
            .lock()
            .get(queue_type)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidQueueParameter(format!("queue type {} is not registered", queue_type))
            })?;

        let queue = factory(params)?;
        info!(
            "Created {} packet queue with capacity {}",
            queue.queue_type(),
            queue.capacity()
        );
        *self.queue.lock() = Some(queue);
        Ok(())
    }

    pub fn destroy_queue(&self) {
        self.queue.lock().take();
    }

    pub fn queue(&self) -> Option<Arc<dyn PacketQueue<T>>> {
        self.queue.lock().clone()
    }

    /// Applies a `packet_queue` configuration map.
    ///
    /// `"enable-queue": false` destroys the queue; `true` builds one from
    /// the remaining parameters.
    pub fn configure(&self, params: &Value) -> Result<()> {
        let enable = params
            .get("enable-queue")
            .and_then(Value::as_bool)
            .ok_or_else(|| {
                Error::InvalidQueueParameter("'enable-queue' must be a boolean".to_string())
            })?;

        if enable {
            self.create_queue(params)
        } else {
            self.destroy_queue();
            info!("Packet queueing disabled");
            Ok(())
        }
    }
}

impl<T: Send + 'static> Default for QueueManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkQueueState<T> {
    items: VecDeque<T>,
    enabled: bool,
}

/// Unbounded blocking queue with a closed state.
///
/// While enabled, [`pop`](WorkQueue::pop) blocks until an item arrives.
/// Once disabled, it returns `None` immediately and every blocked caller is
/// woken.
pub struct WorkQueue<T> {
    state: Mutex<WorkQueueState<T>>,
    available: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkQueueState {
                items: VecDeque::new(),
                enabled: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Returns `false` (dropping the item) if the queue is disabled.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if !state.enabled {
            return false;
        }
        state.items.push_back(item);
        self.available.notify_one();
        true
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if !state.enabled {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.available.wait(&mut state);
        }
    }

    pub fn enable(&self) {
        self.state.lock().enabled = true;
    }

    pub fn disable(&self) {
        self.state.lock().enabled = false;
        self.available.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().items.clear();
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
