//! Keyed one-shot timer wheel.
//!
//! One logical scheduler replaces per-notification OS timers: pending fire
//! times sit in a binary min-heap polled by a single driving job. Every
//! timer is addressable by key, and all timers for a task can be cancelled
//! together, which the task-update path relies on to prevent orphaned
//! reminders. Cancellation is lazy: stale heap entries are dropped when
//! popped because they no longer match the live entry table.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Key addressing one pending timer.
///
/// The tag distinguishes the timers belonging to one task (reminder
/// sequence numbers, follow-up checks).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub task_id: Uuid,
    pub tag: String,
}

impl TimerKey {
    pub fn new(task_id: Uuid, tag: impl Into<String>) -> Self {
        Self {
            task_id,
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for TimerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.task_id, self.tag)
    }
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    fire_at: DateTime<Utc>,
    key: TimerKey,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.key.task_id.cmp(&other.key.task_id))
            .then_with(|| self.key.tag.cmp(&other.key.tag))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct WheelState<T> {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    entries: HashMap<TimerKey, (DateTime<Utc>, T)>,
}

/// A cancellable min-heap of pending fire times.
pub struct TimerWheel<T> {
    state: Mutex<WheelState<T>>,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WheelState {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Register a timer. Scheduling an existing key replaces it.
    pub fn schedule(&self, key: TimerKey, fire_at: DateTime<Utc>, payload: T) {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.insert(key.clone(), (fire_at, payload));
        state.heap.push(Reverse(HeapEntry { fire_at, key }));
    }

    /// Cancel one timer. A cancelled timer never fires.
    pub fn cancel(&self, key: &TimerKey) {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.remove(key);
    }

    /// Cancel every timer belonging to a task.
    pub fn cancel_task(&self, task_id: Uuid) {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.retain(|key, _| key.task_id != task_id);
    }

    /// Cancel a task's timers whose tag starts with `prefix`, leaving the
    /// rest in place.
    pub fn cancel_task_prefix(&self, task_id: Uuid, prefix: &str) {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        state
            .entries
            .retain(|key, _| key.task_id != task_id || !key.tag.starts_with(prefix));
    }

    /// Pop every timer due at or before `now`.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<(TimerKey, T)> {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        let mut due = Vec::new();
        while let Some(Reverse(top)) = state.heap.peek() {
            if top.fire_at > now {
                break;
            }
            let Reverse(entry) = state.heap.pop().expect("peeked entry exists");
            // Stale if cancelled or rescheduled since it was pushed.
            let live = matches!(
                state.entries.get(&entry.key),
                Some((fire_at, _)) if *fire_at == entry.fire_at
            );
            if live {
                let (_, payload) = state
                    .entries
                    .remove(&entry.key)
                    .expect("live entry exists");
                due.push((entry.key, payload));
            }
        }
        due
    }

    /// The earliest pending fire time, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.values().map(|(at, _)| *at).min()
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every timer. Used on dispose.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("timer wheel lock poisoned");
        state.entries.clear();
        state.heap.clear();
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}
