//! Lock-guarded event lists that let any thread hand work to a worker.
//!
//! A producer appends under the lock and signals the notifier only when no
//! wakeup is already pending. The worker swaps the whole list out under the
//! lock and runs the events after releasing it.

use std::io;

use mio::{Registry, Token};
use parking_lot::Mutex;

use crate::notifier::Notifier;

struct Pending<E> {
    events: Vec<E>,
    notified: bool,
    closed: bool,
}

pub struct SafeEventQueue<E> {
    pending: Mutex<Pending<E>>,
    notifier: Notifier,
}

impl<E> SafeEventQueue<E> {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            pending: Mutex::new(Pending {
                events: Vec::new(),
                notified: false,
                closed: false,
            }),
            notifier: Notifier::new()?,
        })
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        self.notifier.register(registry, token)
    }

    /// Queue an event for the worker. Hands the event back once the worker
    /// has stopped taking events.
    pub fn push(&self, event: E) -> Result<(), E> {
        let wake = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(event);
            }
            pending.events.push(event);
            !std::mem::replace(&mut pending.notified, true)
        };
        if wake {
            self.notifier.notify();
        }
        Ok(())
    }

    /// Take every queued event and re-arm notification.
    pub fn take(&self) -> Vec<E> {
        self.notifier.drain();
        let mut pending = self.pending.lock();
        pending.notified = false;
        std::mem::take(&mut pending.events)
    }

    /// Refuse further events, returning whatever was still queued.
    pub fn close(&self) -> Vec<E> {
        let mut pending = self.pending.lock();
        pending.closed = true;
        pending.notified = false;
        std::mem::take(&mut pending.events)
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn push_and_take_preserves_order() {
        let queue = SafeEventQueue::new().expect("queue");
        for i in 0..5 {
            queue.push(i).expect("push");
        }
        assert_eq!(queue.take(), vec![0, 1, 2, 3, 4]);
        assert!(queue.take().is_empty());
    }

    #[test]
    fn only_first_push_signals() {
        let queue = SafeEventQueue::new().expect("queue");
        queue.push(1).expect("push");
        queue.push(2).expect("push");
        assert!(queue.notifier.drain());
        // no second wakeup while the first is outstanding
        queue.push(3).expect("push");
        assert!(!queue.notifier.drain());
        assert_eq!(queue.take(), vec![1, 2, 3]);

        queue.push(4).expect("push");
        assert!(queue.notifier.drain());
    }

    #[test]
    fn closed_queue_returns_events() {
        let queue = SafeEventQueue::new().expect("queue");
        queue.push("queued").expect("push");
        assert_eq!(queue.close(), vec!["queued"]);
        assert_eq!(queue.push("late"), Err("late"));
        assert!(queue.is_closed());
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(SafeEventQueue::new().expect("queue"));
        let producers: Vec<_> = (0..8)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        queue.push(t * 1000 + i).expect("push");
                    }
                })
            })
            .collect();
        let mut seen = Vec::new();
        for p in producers {
            p.join().expect("producer panicked");
        }
        seen.extend(queue.take());
        seen.sort_unstable();
        let expected: Vec<_> = (0..8)
            .flat_map(|t| (0..500).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(seen, expected);
    }
}
