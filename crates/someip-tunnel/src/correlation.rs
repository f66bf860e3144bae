//! Pending-request correlation table.
//!
//! Maps bridge-generated 64-bit ids to the RPC request awaiting a response.
//! Each entry is consumed at most once. The table lock is only ever held
//! for the map operation itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::rpc::Message;

/// Correlation id reserved for "no response expected".
pub const NO_CORRELATION: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("correlation id {0:#018x} is already pending")]
    Duplicate(u64),

    #[error("correlation id 0 is reserved")]
    Reserved,
}

/// Draws a fresh random non-zero correlation id.
///
/// The two halves of a v4 uuid are folded together so the fixed version
/// and variant bits each land on a random bit of the other half.
pub fn new_correlation_id() -> u64 {
    loop {
        let (high, low) = uuid::Uuid::new_v4().as_u64_pair();
        let id = high ^ low;
        if id != NO_CORRELATION {
            return id;
        }
    }
}

struct Pending {
    request: Arc<Message>,
    inserted: Instant,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<u64, Pending>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation table lock poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Records a pending request. Never overwrites an existing entry.
    pub fn insert(&self, id: u64, request: Arc<Message>) -> Result<(), CorrelationError> {
        if id == NO_CORRELATION {
            return Err(CorrelationError::Reserved);
        }
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(CorrelationError::Duplicate(id));
        }
        entries.insert(
            id,
            Pending {
                request,
                inserted: Instant::now(),
            },
        );
        Ok(())
    }

    /// Removes and returns the request pending under `id`.
    pub fn take(&self, id: u64) -> Option<Arc<Message>> {
        self.entries().remove(&id).map(|pending| pending.request)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Removes every entry older than `ttl`.
    pub fn sweep_expired(&self, ttl: Duration) -> Vec<(u64, Arc<Message>)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.entries().retain(|id, pending| {
            if now.saturating_duration_since(pending.inserted) >= ttl {
                expired.push((*id, Arc::clone(&pending.request)));
                false
            } else {
                true
            }
        });
        expired
    }

    /// Removes every entry.
    pub fn drain(&self) -> Vec<(u64, Arc<Message>)> {
        self.entries()
            .drain()
            .map(|(id, pending)| (id, pending.request))
            .collect()
    }
}
