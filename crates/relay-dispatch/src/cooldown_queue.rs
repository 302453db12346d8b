use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};

/// A generic "wake me at the next deadline" recovery queue.
///
/// The conductor's own availability check is lazy and pull-based (a
/// past-dated cooldown is simply treated as expired on next read), so
/// this queue is not the source of truth for whether a credential is
/// available — it only drives a background notification (structured log,
/// external registry resume hook) at the moment a cooldown naturally lapses.
pub struct CooldownQueue<K: Ord + Clone + Send + Sync + Debug + 'static> {
    heap: Mutex<BinaryHeap<Reverse<(Instant, K)>>>,
    notify: Notify,
}

impl<K: Ord + Clone + Send + Sync + Debug + 'static> CooldownQueue<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        })
    }

    pub async fn push(&self, until: Instant, key: K) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, key)));
        }
        self.notify.notify_one();
    }

    /// Spawns the recovery task; `on_due` is invoked (outside any lock) for
    /// every key whose deadline has passed, in deadline order.
    pub fn spawn_recover_task<F>(self: Arc<Self>, on_due: F)
    where
        F: Fn(K) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, _))| *t)
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some(deadline) => sleep_until(deadline).await,
                }

                let now = Instant::now();
                let mut due = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    loop {
                        let is_due = matches!(heap.peek(), Some(Reverse((t, _))) if *t <= now);
                        if !is_due {
                            break;
                        }
                        let Reverse((_, key)) = heap.pop().unwrap();
                        due.push(key);
                    }
                }

                for key in due {
                    on_due(key);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fires_due_entries_in_deadline_order() {
        let queue = CooldownQueue::<String>::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let fired_clone = fired.clone();
        queue.clone().spawn_recover_task(move |key| {
            let fired_clone = fired_clone.clone();
            tokio::spawn(async move {
                fired_clone.lock().await.push(key);
            });
        });

        let now = Instant::now();
        queue.push(now + Duration::from_millis(20), "second".to_string()).await;
        queue.push(now + Duration::from_millis(5), "first".to_string()).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let count = fired.lock().await.len();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn idle_queue_never_fires() {
        let queue = CooldownQueue::<String>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        queue.spawn_recover_task(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
