//! Outstanding-request tracking.
//!
//! Every outgoing request carries a fresh message id; a waiter registered
//! under that id receives either the matching response envelope or
//! [`Error::Timeout`] once the deadline passes. Waiters always run outside
//! the tracker's lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::common::messages::Envelope;
use crate::{Error, Result};

/// Callback invoked with the response to one outstanding request.
pub type Waiter = Box<dyn FnOnce(Result<Envelope>) + Send>;

struct Outstanding {
    waiter: Waiter,
    deadline: Instant,
}

pub struct Timer {
    next_id: AtomicU32,
    timeout: Duration,
    outstanding: Mutex<BTreeMap<u32, Outstanding>>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            // Id zero is reserved for envelopes nobody waits on.
            next_id: AtomicU32::new(1),
            timeout,
            outstanding: Mutex::new(BTreeMap::new()),
        }
    }

    /// A fresh correlation id.
    pub fn new_message_id(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Register a waiter for the given message id.
    pub fn add(&self, message_id: u32, waiter: Waiter) {
        let deadline = Instant::now() + self.timeout;
        self.outstanding
            .lock()
            .expect("timer mutex poisoned")
            .insert(message_id, Outstanding { waiter, deadline });
    }

    /// Hand the response to its waiter, if one is still registered.
    pub fn resolve(&self, message: &Envelope) -> bool {
        let entry = self
            .outstanding
            .lock()
            .expect("timer mutex poisoned")
            .remove(&message.id);

        match entry {
            Some(entry) => {
                (entry.waiter)(Ok(message.clone()));
                true
            }
            None => false,
        }
    }

    /// Forget an outstanding request without invoking its waiter.
    pub fn cancel(&self, message_id: u32) -> bool {
        self.outstanding
            .lock()
            .expect("timer mutex poisoned")
            .remove(&message_id)
            .is_some()
    }

    /// Fire timeout errors for every request past its deadline.
    pub fn expire(&self) {
        let now = Instant::now();
        let expired: Vec<(u32, Outstanding)> = {
            let mut outstanding = self.outstanding.lock().expect("timer mutex poisoned");
            let ids: Vec<u32> = outstanding
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| outstanding.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in expired {
            trace!(message_id = id, "outstanding request timed out");
            (entry.waiter)(Err(Error::Timeout));
        }
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding
            .lock()
            .expect("timer mutex poisoned")
            .len()
    }
}
