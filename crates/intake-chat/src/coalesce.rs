//! Burst coalescing for rapid candidate messages.
//!
//! Candidates often send one thought as several short lines. The first
//! line of a burst becomes the leader: it waits out the window, then takes
//! every line that arrived meanwhile and runs a single AI turn over them.
//! Later lines in the same window are followers and return immediately.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

pub struct BurstCoalescer {
    window: Duration,
    pending: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl BurstCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Submit a line for `key`.
    ///
    /// Returns the joined burst for the leader and `None` for followers.
    /// With a zero window every line is its own burst.
    pub async fn submit(&self, key: Uuid, text: String) -> Option<String> {
        if self.window.is_zero() {
            return Some(text);
        }

        {
            let mut pending = self.lock();
            if let Some(parts) = pending.get_mut(&key) {
                parts.push(text);
                return None;
            }
            pending.insert(key, vec![text]);
        }

        tokio::time::sleep(self.window).await;

        let parts = self.lock().remove(&key).unwrap_or_default();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<String>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
