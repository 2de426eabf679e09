// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Queue types for inter-thread communication with integrated wakeups.
//!
//! `Queues` connects two sides, `a` and `b`, where each receiver has its own
//! bounded queue and its own `mio::Waker`. Senders may target a specific
//! receiver, any receiver (balanced at random), or all receivers. Items are
//! wrapped with the sender's identifier so that responses can be routed back.

pub use net::Waker;

use crossbeam_queue::ArrayQueue;
use rand::distributions::Uniform;
use rand::Rng as RandRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;

pub struct Queues<T, U> {
    senders: Vec<WakingSender<TrackedItem<T>>>,
    receiver: Arc<ArrayQueue<TrackedItem<U>>>,
    id: usize,
    rng: ChaCha20Rng,
    distr: Uniform<usize>,
}

struct WakingSender<T> {
    inner: Arc<ArrayQueue<T>>,
    waker: Arc<Waker>,
    needs_wake: bool,
}

impl<T> Clone for WakingSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            waker: self.waker.clone(),
            needs_wake: false,
        }
    }
}

impl<T> WakingSender<T> {
    fn try_send(&mut self, item: T) -> Result<(), T> {
        let result = self.inner.push(item);
        if result.is_ok() {
            self.needs_wake = true;
        }
        result
    }

    fn wake(&mut self) -> Result<(), std::io::Error> {
        if self.needs_wake {
            let result = self.waker.wake();
            if result.is_ok() {
                self.needs_wake = false;
            }
            result
        } else {
            Ok(())
        }
    }
}

impl<T, U> Queues<T, U> {
    /// Construct the queues for communicating between both sides. Side `a`
    /// sends items of type `T` to side `b`; side `b` sends items of type `U`
    /// to side `a`. The wakers must be the ones registered with each side's
    /// `mio::Poll` instance, in the same order as the queues returned.
    pub fn new<A: AsRef<[Arc<Waker>]>, B: AsRef<[Arc<Waker>]>>(
        a_wakers: A,
        b_wakers: B,
        capacity: usize,
    ) -> (Vec<Queues<T, U>>, Vec<Queues<U, T>>) {
        let mut a_wakers = a_wakers.as_ref().to_vec();
        let mut b_wakers = b_wakers.as_ref().to_vec();

        // sending side a -> b: one `WakingSender` per side b queue
        let mut a_tx = Vec::<WakingSender<TrackedItem<T>>>::with_capacity(b_wakers.len());
        let mut b_rx = Vec::<Arc<ArrayQueue<TrackedItem<T>>>>::with_capacity(b_wakers.len());

        for waker in b_wakers.drain(..) {
            let q = Arc::new(ArrayQueue::new(capacity));
            a_tx.push(WakingSender {
                inner: q.clone(),
                waker,
                needs_wake: false,
            });
            b_rx.push(q);
        }

        // sending side b -> a: one `WakingSender` per side a queue
        let mut b_tx = Vec::<WakingSender<TrackedItem<U>>>::with_capacity(a_wakers.len());
        let mut a_rx = Vec::<Arc<ArrayQueue<TrackedItem<U>>>>::with_capacity(a_wakers.len());

        for waker in a_wakers.drain(..) {
            let q = Arc::new(ArrayQueue::new(capacity));
            b_tx.push(WakingSender {
                inner: q.clone(),
                waker,
                needs_wake: false,
            });
            a_rx.push(q);
        }

        let mut a = Vec::new();
        let mut b = Vec::new();

        for (id, receiver) in a_rx.drain(..).enumerate() {
            a.push(Queues {
                senders: a_tx.clone(),
                receiver,
                rng: ChaCha20Rng::from_entropy(),
                distr: Uniform::new(0, a_tx.len()),
                id,
            })
        }

        for (id, receiver) in b_rx.drain(..).enumerate() {
            b.push(Queues {
                senders: b_tx.clone(),
                receiver,
                rng: ChaCha20Rng::from_entropy(),
                distr: Uniform::new(0, b_tx.len()),
                id,
            })
        }

        (a, b)
    }

    /// Try to receive a single item from the queue.
    pub fn try_recv(&self) -> Option<TrackedItem<U>> {
        self.receiver.pop()
    }

    /// Try to receive all pending items from the queue.
    pub fn try_recv_all(&self, buf: &mut Vec<TrackedItem<U>>) {
        let pending = self.receiver.len();
        for _ in 0..pending {
            if let Some(item) = self.receiver.pop() {
                buf.push(item);
            }
        }
    }

    /// Try to send a single item to the receiver specified by the `id`.
    pub fn try_send_to(&mut self, id: usize, item: T) -> Result<(), T> {
        self.senders[id]
            .try_send(TrackedItem {
                sender: self.id,
                inner: item,
            })
            .map_err(|e| e.into_inner())
    }

    /// Try to send a single item to any receiver, picked uniformly at random
    /// to keep receivers roughly balanced.
    pub fn try_send_any(&mut self, item: T) -> Result<(), T> {
        let id = self.rng.sample(self.distr);
        self.senders[id]
            .try_send(TrackedItem {
                sender: self.id,
                inner: item,
            })
            .map_err(|e| e.into_inner())
    }

    /// Wake any remote receivers which have been sent items since the last
    /// time this was called.
    pub fn wake(&mut self) -> Result<(), std::io::Error> {
        let mut result = Ok(());
        for sender in self.senders.iter_mut() {
            if let Err(e) = sender.wake() {
                result = Err(e);
            }
        }
        result
    }
}

impl<T: Clone, U> Queues<T, U> {
    /// Broadcast the item to all receivers on the other side.
    pub fn try_send_all(&mut self, item: T) -> Result<(), T> {
        let mut result = Ok(());
        for sender in self.senders.iter_mut() {
            if sender
                .try_send(TrackedItem {
                    sender: self.id,
                    inner: item.clone(),
                })
                .is_err()
            {
                result = Err(item.clone());
            }
        }
        result
    }
}

pub struct TrackedItem<T> {
    sender: usize,
    inner: T,
}

impl<T> TrackedItem<T> {
    pub fn sender(&self) -> usize {
        self.sender
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use crate::Queues;
    use ::net::*;
    use std::sync::Arc;

    const WAKER_TOKEN: Token = Token(usize::MAX);

    #[test]
    fn basic() {
        let poll = Poll::new().expect("failed to create event loop");
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).expect("failed to create waker"));

        let (mut a, mut b) = Queues::<usize, String>::new(vec![waker.clone()], vec![waker], 1024);
        let mut a = a.remove(0);
        let mut b = b.remove(0);

        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_none());

        // targeted send from A -> B
        a.try_send_to(0, 1).expect("failed to send");
        assert!(a.try_recv().is_none());
        assert_eq!(
            b.try_recv().map(|v| (v.sender(), v.into_inner())),
            Some((0, 1))
        );

        // balanced (any) send from A -> B
        a.try_send_any(2).expect("failed to send");
        assert_eq!(
            b.try_recv().map(|v| (v.sender(), v.into_inner())),
            Some((0, 2))
        );

        // broadcast send from A -> B
        a.try_send_all(3).expect("failed to send");
        assert_eq!(
            b.try_recv().map(|v| (v.sender(), v.into_inner())),
            Some((0, 3))
        );

        // reply from B -> A
        b.try_send_to(0, "apple".to_string())
            .expect("failed to send");
        assert_eq!(
            a.try_recv().map(|v| (v.sender(), v.into_inner())),
            Some((0, "apple".to_string()))
        );
    }
}
