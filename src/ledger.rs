// Activity ledger: which users have been seen recently, for periodic presence rewards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::chat::UserId;
use crate::metrics;

/// Last observed activity for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
}

impl ActivityRecord {
    /// Time elapsed since the user was last seen. Zero if `last_seen` is in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Thread-safe in-memory table of user activity.
#[derive(Debug, Clone)]
pub struct ActivityLedger {
    inner: Arc<Mutex<HashMap<UserId, ActivityRecord>>>,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert or refresh a user's record.
    ///
    /// The display name always takes the latest value. `last_seen` never moves
    /// backwards, so a late-delivered event cannot make a user look older.
    pub fn touch(&self, user_id: UserId, display_name: &str, now: DateTime<Utc>) {
        let mut map = self.inner.lock().unwrap();
        let record = map.entry(user_id).or_insert_with(|| ActivityRecord {
            user_id,
            display_name: String::new(),
            last_seen: now,
        });
        record.display_name = display_name.to_string();
        if now > record.last_seen {
            record.last_seen = now;
        }
        metrics::TRACKED_USERS.set(map.len() as i64);
    }

    /// Copy of every record, for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<ActivityRecord> {
        let map = self.inner.lock().unwrap();
        map.values().cloned().collect()
    }

    /// Remove every record whose age exceeds `max_age` and return their user ids.
    pub fn evict_older_than(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<UserId> {
        let mut map = self.inner.lock().unwrap();
        let mut evicted = Vec::new();
        map.retain(|user_id, record| {
            if record.age(now) > max_age {
                evicted.push(*user_id);
                false
            } else {
                true
            }
        });
        metrics::TRACKED_USERS.set(map.len() as i64);
        evicted
    }

    pub fn get(&self, user_id: UserId) -> Option<ActivityRecord> {
        let map = self.inner.lock().unwrap();
        map.get(&user_id).cloned()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.lock().unwrap();
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ActivityLedger {
    fn default() -> Self {
        Self::new()
    }
}
