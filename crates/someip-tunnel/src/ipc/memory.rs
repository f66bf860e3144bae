//! In-process transport.
//!
//! Services are kept in a registry shared by every clone of
//! [`MemoryTransport`]. Each subscriber owns a bounded queue; publishing
//! pushes a copy of the record into the service history and into every
//! subscriber queue, evicting the oldest entry of a full queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::{IpcError, Publisher, ServiceConfig, Subscriber, Transport, validate};
use crate::wire::{RECORD_SIZE, Record};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Transport lock poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

struct Queue {
    records: Mutex<VecDeque<Box<Record>>>,
    ready: Condvar,
    capacity: usize,
}

impl Queue {
    fn push(&self, record: Box<Record>) -> bool {
        let mut records = lock(&self.records);
        let evicted = if records.len() >= self.capacity {
            records.pop_front();
            true
        } else {
            false
        };
        records.push_back(record);
        drop(records);
        self.ready.notify_all();
        evicted
    }
}

struct Channel {
    name: String,
    history_size: usize,
    history: Mutex<VecDeque<Box<Record>>>,
    subscribers: Mutex<Vec<Weak<Queue>>>,
}

impl Channel {
    fn publish(&self, record: &Record) {
        // Same lock order as `attach`: a subscriber either replays this
        // record from history or receives it here, never both.
        let mut history = lock(&self.history);
        if self.history_size > 0 {
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(Box::new(*record));
        }

        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|queue| queue.strong_count() > 0);
        for queue in subscribers.iter().filter_map(Weak::upgrade) {
            if queue.push(Box::new(*record)) {
                tracing::warn!(service = %self.name, "Subscriber buffer full, dropped oldest record");
            }
        }
    }

    fn attach(&self, capacity: usize) -> Arc<Queue> {
        let history = lock(&self.history);
        let replay: VecDeque<Box<Record>> = history
            .iter()
            .skip(history.len().saturating_sub(capacity))
            .cloned()
            .collect();
        let queue = Arc::new(Queue {
            records: Mutex::new(replay),
            ready: Condvar::new(),
            capacity,
        });
        // Registered while the history lock is held so no record is missed
        // or replayed twice.
        lock(&self.subscribers).push(Arc::downgrade(&queue));
        drop(history);
        queue
    }
}

/// Transport whose services live in this process.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    services: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, config: &ServiceConfig) -> Result<Arc<Channel>, IpcError> {
        validate(config)?;
        let mut services = lock(&self.services);
        let channel = services
            .entry(config.name.clone())
            .or_insert_with(|| {
                tracing::debug!(service = %config.name, "Created in-memory service");
                Arc::new(Channel {
                    name: config.name.clone(),
                    history_size: config.history_size,
                    history: Mutex::new(VecDeque::new()),
                    subscribers: Mutex::new(Vec::new()),
                })
            });
        if channel.history_size != config.history_size {
            return Err(IpcError::Incompatible {
                name: config.name.clone(),
                reason: format!(
                    "history size {} requested, service has {}",
                    config.history_size, channel.history_size
                ),
            });
        }
        Ok(Arc::clone(channel))
    }
}

impl Transport for MemoryTransport {
    fn open_publisher(&self, config: &ServiceConfig) -> Result<Box<dyn Publisher>, IpcError> {
        Ok(Box::new(MemoryPublisher {
            channel: self.channel(config)?,
            loaned: None,
        }))
    }

    fn open_subscriber(&self, config: &ServiceConfig) -> Result<Box<dyn Subscriber>, IpcError> {
        let channel = self.channel(config)?;
        let queue = channel.attach(config.subscriber_max_buffer_size);
        Ok(Box::new(MemorySubscriber { queue }))
    }
}

pub struct MemoryPublisher {
    channel: Arc<Channel>,
    loaned: Option<Box<Record>>,
}

impl Publisher for MemoryPublisher {
    fn loan(&mut self) -> Result<&mut Record, IpcError> {
        let record = self
            .loaned
            .get_or_insert_with(|| Box::new([0u8; RECORD_SIZE]));
        Ok(&mut **record)
    }

    fn send(&mut self) -> Result<(), IpcError> {
        let record = self.loaned.take().ok_or(IpcError::NothingLoaned)?;
        self.channel.publish(&record);
        Ok(())
    }
}

pub struct MemorySubscriber {
    queue: Arc<Queue>,
}

impl Subscriber for MemorySubscriber {
    fn wait(&mut self, timeout: Duration) -> Result<(), IpcError> {
        let records = lock(&self.queue.records);
        if records.is_empty() {
            // Timeout and spurious wake-ups are both fine here.
            let _ = self
                .queue
                .ready
                .wait_timeout_while(records, timeout, |records| records.is_empty());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Box<Record>>, IpcError> {
        Ok(lock(&self.queue.records).pop_front())
    }
}
