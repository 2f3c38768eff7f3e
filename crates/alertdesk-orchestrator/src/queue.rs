use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use uuid::Uuid;

/// Raised when a queue is at capacity and cannot accept more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueError;

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue at capacity")
    }
}

impl std::error::Error for EnqueueError {}

struct State {
    by_user: BTreeMap<Uuid, VecDeque<Uuid>>,
    /// Round-robin cursor: users with pending work, each visited once per lap.
    order: VecDeque<Uuid>,
    closed: bool,
}

/// A bounded work queue with per-user round-robin fairness: a user with many
/// queued transactions can never starve a user with one. Used both for
/// incoming transactions (keyed by the owning user) and for outbound
/// notifications (keyed by the notification's user).
pub struct FairQueue {
    state: Mutex<State>,
    notify: Notify,
    len: AtomicUsize,
    capacity: usize,
}

impl FairQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                by_user: BTreeMap::new(),
                order: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `item` under `user_id`. Fails with `EnqueueError` once the
    /// queue holds `capacity` items total, regardless of which user they
    /// belong to.
    pub fn push(&self, user_id: Uuid, item: Uuid) -> Result<(), EnqueueError> {
        let mut state = self.state.lock().unwrap();
        if self.len.load(Ordering::Relaxed) >= self.capacity {
            return Err(EnqueueError);
        }
        let was_empty = match state.by_user.get_mut(&user_id) {
            Some(q) => {
                q.push_back(item);
                false
            }
            None => {
                let mut q = VecDeque::new();
                q.push_back(item);
                state.by_user.insert(user_id, q);
                true
            }
        };
        if was_empty {
            state.order.push_back(user_id);
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the next item in round-robin order, waiting for work if the
    /// queue is empty. Returns `None` once the queue has been closed and
    /// drained, signalling a worker to exit.
    pub async fn pop(&self) -> Option<(Uuid, Uuid)> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(user_id) = state.order.pop_front() {
                    let item = {
                        let q = state.by_user.get_mut(&user_id).expect("order entry implies a queue");
                        let item = q.pop_front().expect("non-empty by construction");
                        if !q.is_empty() {
                            state.order.push_back(user_id);
                        } else {
                            state.by_user.remove(&user_id);
                        }
                        item
                    };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some((user_id, item));
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stops future waiters once the queue drains; wakes everyone currently
    /// parked in `pop` so they can observe `closed` and exit.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_across_users_before_revisiting() {
        let q = FairQueue::new(10);
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        q.push(u1, Uuid::new_v4()).unwrap();
        q.push(u1, Uuid::new_v4()).unwrap();
        q.push(u2, Uuid::new_v4()).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (first_user, _) = rt.block_on(q.pop()).unwrap();
        let (second_user, _) = rt.block_on(q.pop()).unwrap();
        assert_eq!(first_user, u1);
        assert_eq!(second_user, u2, "u2's single item must not wait behind all of u1's backlog");
    }

    #[test]
    fn push_fails_once_capacity_is_reached() {
        let q = FairQueue::new(1);
        let u = Uuid::new_v4();
        q.push(u, Uuid::new_v4()).unwrap();
        assert!(q.push(u, Uuid::new_v4()).is_err());
    }

    #[test]
    fn pop_returns_none_after_close_drains() {
        let q = FairQueue::new(4);
        q.close();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(rt.block_on(q.pop()).is_none());
    }
}
