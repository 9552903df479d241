//! Async pool of reusable items.
//!
//! Consumers lease items; a dropped [`Lease`] hands its item straight to the
//! longest-waiting consumer, or back to the available set when nobody waits.
//! No item is ever leased to two holders at once.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_core::{HostError, HostResult};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct State<T> {
    available: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    total: usize,
    in_use: usize,
    disposed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `item` to the first live waiter, else park it. Caller holds the
    /// lock and has already accounted for the item as not in use.
    fn give(state: &mut State<T>, mut item: T) {
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(item) {
                Ok(()) => {
                    state.in_use += 1;
                    return;
                }
                // Waiter gave up; try the next one.
                Err(returned) => item = returned,
            }
        }
        state.available.push_back(item);
    }

    fn release(&self, item: T) {
        let mut state = self.lock();
        state.in_use -= 1;
        if state.disposed {
            state.total -= 1;
            drop(state);
            drop(item);
            return;
        }
        Self::give(&mut state, item);
    }
}

/// FIFO-fair pool of `T`.
pub struct WaitQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WaitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    available: VecDeque::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    in_use: 0,
                    disposed: false,
                }),
            }),
        }
    }

    /// Add a new item, growing the pool by one.
    pub fn enqueue(&self, item: T) -> HostResult<()> {
        let mut state = self.shared.lock();
        if state.disposed {
            return Err(HostError::Disposed("wait queue"));
        }
        state.total += 1;
        Shared::give(&mut state, item);
        Ok(())
    }

    /// Add a new item and lease it to the caller right away.
    pub fn insert_leased(&self, item: T) -> HostResult<Lease<T>> {
        let mut state = self.shared.lock();
        if state.disposed {
            return Err(HostError::Disposed("wait queue"));
        }
        state.total += 1;
        state.in_use += 1;
        Ok(self.lease(item))
    }

    /// Lease an available item without waiting.
    pub fn try_dequeue(&self) -> HostResult<Option<Lease<T>>> {
        let mut state = self.shared.lock();
        if state.disposed {
            return Err(HostError::Disposed("wait queue"));
        }
        Ok(state.available.pop_front().map(|item| {
            state.in_use += 1;
            self.lease(item)
        }))
    }

    /// Lease an item, waiting in line when none is available.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> HostResult<Lease<T>> {
        let rx = {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(HostError::Disposed("wait queue"));
            }
            if let Some(item) = state.available.pop_front() {
                state.in_use += 1;
                return Ok(self.lease(item));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let mut waiter = Waiter {
            rx,
            shared: Arc::clone(&self.shared),
        };
        tokio::select! {
            biased;
            received = &mut waiter.rx => match received {
                Ok(item) => Ok(self.lease(item)),
                Err(_) => Err(HostError::Disposed("wait queue")),
            },
            _ = cancel.cancelled() => Err(HostError::Cancelled),
        }
    }

    /// Take an item out of the pool for good, shrinking it by one.
    pub async fn remove(&self, cancel: &CancellationToken) -> HostResult<T> {
        let lease = self.dequeue(cancel).await?;
        Ok(lease.discard())
    }

    /// Drop every available item and fail pending waiters. Items still leased
    /// are dropped when their lease ends.
    pub fn dispose(&self) {
        let (items, waiters) = {
            let mut state = self.shared.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let items: Vec<T> = state.available.drain(..).collect();
            state.total -= items.len();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            (items, waiters)
        };
        drop(waiters);
        drop(items);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    pub fn total_count(&self) -> usize {
        self.shared.lock().total
    }

    pub fn available_count(&self) -> usize {
        self.shared.lock().available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.shared.lock().in_use
    }

    /// Consumers currently waiting for an item.
    pub fn awaiters_count(&self) -> usize {
        let state = self.shared.lock();
        state.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn lease(&self, item: T) -> Lease<T> {
        Lease {
            item: Some(item),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Pending dequeue. Dropping it (cancellation, or the future being dropped)
/// returns an item that raced in after the caller stopped listening.
struct Waiter<T> {
    rx: oneshot::Receiver<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(item) = self.rx.try_recv() {
            self.shared.release(item);
        }
    }
}

/// Exclusive use of one pooled item; returns it to the pool on drop.
pub struct Lease<T> {
    item: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T> Lease<T> {
    /// Keep the item and shrink the pool instead of returning it.
    pub fn discard(mut self) -> T {
        let mut state = self.shared.lock();
        state.in_use -= 1;
        state.total -= 1;
        drop(state);
        match self.item.take() {
            Some(item) => item,
            // `item` is only taken here or in `drop`.
            None => unreachable!("lease already released"),
        }
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("lease already released"),
        }
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("lease already released"),
        }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.shared.release(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assert_balanced<T>(queue: &WaitQueue<T>) {
        assert_eq!(
            queue.available_count() + queue.in_use_count(),
            queue.total_count(),
            "available + in use must equal total"
        );
    }

    #[tokio::test]
    async fn lease_returns_item_on_drop() {
        let queue = WaitQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();

        let a = queue.dequeue(&cancel).await.unwrap();
        let b = queue.dequeue(&cancel).await.unwrap();
        assert_ne!(*a, *b);
        assert_eq!(queue.in_use_count(), 2);
        assert_balanced(&queue);

        drop(a);
        assert_eq!(queue.available_count(), 1);
        assert_balanced(&queue);
        drop(b);
        assert_eq!(queue.available_count(), 2);
        assert_balanced(&queue);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let queue: WaitQueue<u32> = WaitQueue::new();
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for id in 0..3u32 {
            let task_queue = queue.clone();
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = task_queue.dequeue(&cancel).await.unwrap();
                order.lock().unwrap().push((id, *lease));
                lease.discard();
            }));
            // Let this waiter register before the next one.
            while queue.awaiters_count() < (id + 1) as usize {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(queue.available_count(), 0);

        for item in [10, 20, 30] {
            queue.enqueue(item).unwrap();
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![(0, 10), (1, 20), (2, 30)]);
        assert_eq!(queue.total_count(), 0);
    }

    #[tokio::test]
    async fn returned_item_goes_to_next_waiter() {
        let queue = WaitQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue("session").unwrap();
        let held = queue.dequeue(&cancel).await.unwrap();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { *queue.dequeue(&cancel).await.unwrap() })
        };
        while queue.awaiters_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(held);
        assert_eq!(waiter.await.unwrap(), "session");
        assert_balanced(&queue);
        assert_eq!(queue.available_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_lose_items() {
        let queue: WaitQueue<u8> = WaitQueue::new();
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await.map(|_| ()) })
        };
        while queue.awaiters_count() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(HostError::Cancelled)));

        queue.enqueue(7).unwrap();
        assert_eq!(queue.available_count(), 1);
        assert_eq!(queue.awaiters_count(), 0);
        assert_balanced(&queue);
    }

    #[tokio::test]
    async fn dropped_dequeue_future_is_harmless() {
        let queue: WaitQueue<u8> = WaitQueue::new();
        let cancel = CancellationToken::new();
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), queue.dequeue(&cancel)).await;
        assert!(timed_out.is_err());
        queue.enqueue(1).unwrap();
        assert_eq!(queue.available_count(), 1);
        assert_balanced(&queue);
    }

    #[tokio::test]
    async fn remove_shrinks_capacity() {
        let queue = WaitQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        let removed = queue.remove(&cancel).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.total_count(), 1);
        assert_balanced(&queue);
    }

    #[tokio::test]
    async fn operations_after_dispose_fail() {
        let queue = WaitQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(1).unwrap();
        let held = queue.dequeue(&cancel).await.unwrap();
        queue.enqueue(2).unwrap();

        queue.dispose();
        assert_eq!(queue.total_count(), 1);
        assert!(matches!(queue.enqueue(3), Err(HostError::Disposed(_))));
        assert!(matches!(queue.dequeue(&cancel).await, Err(HostError::Disposed(_))));

        drop(held);
        assert_eq!(queue.total_count(), 0);
        assert_balanced(&queue);
    }

    #[tokio::test]
    async fn dispose_fails_pending_waiters() {
        let queue: WaitQueue<u8> = WaitQueue::new();
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await.map(|_| ()) })
        };
        while queue.awaiters_count() == 0 {
            tokio::task::yield_now().await;
        }
        queue.dispose();
        assert!(matches!(waiter.await.unwrap(), Err(HostError::Disposed(_))));
    }

    #[tokio::test]
    async fn concurrent_holders_never_share_an_item() {
        let queue: WaitQueue<usize> = WaitQueue::new();
        for i in 0..3 {
            queue.enqueue(i).unwrap();
        }
        let holders = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let queue = queue.clone();
            let holders = Arc::clone(&holders);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                for _ in 0..10 {
                    let lease = queue.dequeue(&cancel).await.unwrap();
                    assert!(holders.lock().unwrap().insert(*lease), "item leased twice");
                    tokio::task::yield_now().await;
                    holders.lock().unwrap().remove(&*lease);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(queue.available_count(), 3);
        assert_balanced(&queue);
    }
}
