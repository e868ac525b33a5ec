//! Exclusive and counting locks shared by builds and steps.
//!
//! A lock tracks its current holders and a queue of waiters. Waiting is
//! never a grant: a woken waiter re-checks availability and claims for
//! itself, since someone earlier in line may have taken the lock first.
//!
//! Acquisitions of a whole [`LockSet`] are all-or-nothing. Each acquisition
//! draws a ticket when it first has to wait, and every lock orders its
//! waiters by ticket, so all locks agree on who arrived first.

use buildit_core::{AccessMode, ResourceId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::LockError;

/// Identity of whatever holds a lock: a build or a step.
pub type ConsumerId = ResourceId;

static NEXT_TICKET: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
struct Holding {
    mode: AccessMode,
    count: u32,
}

struct Waiter {
    consumer: ConsumerId,
    ticket: u64,
    mode: AccessMode,
    count: u32,
    wake: Arc<Notify>,
}

struct LockState {
    max_count: u32,
    holders: HashMap<ConsumerId, Holding>,
    /// Sorted by ticket.
    waiters: Vec<Waiter>,
}

impl LockState {
    fn is_available(&self, consumer: ConsumerId, mode: AccessMode, count: u32) -> bool {
        if self.holders.contains_key(&consumer) {
            return false;
        }

        let ahead = match self.waiters.iter().position(|w| w.consumer == consumer) {
            Some(idx) => &self.waiters[..idx],
            None => &self.waiters[..],
        };

        match mode {
            AccessMode::Exclusive => self.holders.is_empty() && ahead.is_empty(),
            AccessMode::Counting => {
                let exclusive_held = self
                    .holders
                    .values()
                    .any(|h| h.mode == AccessMode::Exclusive);
                let held: u64 = self.holders.values().map(|h| u64::from(h.count)).sum();
                let queued: u64 = ahead.iter().map(|w| u64::from(w.count)).sum();
                !exclusive_held
                    && ahead.iter().all(|w| w.mode == AccessMode::Counting)
                    && held + queued + u64::from(count) <= u64::from(self.max_count)
            }
        }
    }

    fn wake_waiters(&self) {
        for waiter in &self.waiters {
            if self.is_available(waiter.consumer, waiter.mode, waiter.count) {
                waiter.wake.notify_one();
            }
        }
    }
}

/// A named mutual-exclusion primitive.
///
/// Exclusive locks are counting locks with a max count of one.
pub struct Lock {
    name: String,
    state: Mutex<LockState>,
}

impl Lock {
    pub fn new(name: impl Into<String>, max_count: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(LockState {
                max_count: max_count.max(1),
                holders: HashMap::new(),
                waiters: Vec::new(),
            }),
        })
    }

    pub fn exclusive(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, 1)
    }

    pub fn counting(name: impl Into<String>, max_count: u32) -> Arc<Self> {
        Self::new(name, max_count)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_count(&self) -> u32 {
        self.state().max_count
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a consumer-side access mode to this lock.
    pub fn access(self: &Arc<Self>, mode: AccessMode, count: u32) -> Result<LockAccess, LockError> {
        let max_count = self.max_count();
        let count = match mode {
            AccessMode::Exclusive => 1,
            AccessMode::Counting => count,
        };
        if count == 0 || count > max_count {
            return Err(LockError::InvalidAccess {
                lock: self.name.clone(),
                message: format!("count {} outside 1..={}", count, max_count),
            });
        }
        Ok(LockAccess {
            lock: Arc::clone(self),
            mode,
            count,
        })
    }

    /// Exclusive access; always valid.
    pub fn exclusive_access(self: &Arc<Self>) -> LockAccess {
        LockAccess {
            lock: Arc::clone(self),
            mode: AccessMode::Exclusive,
            count: 1,
        }
    }

    /// Counting access for a single slot; always valid.
    pub fn counting_access(self: &Arc<Self>) -> LockAccess {
        LockAccess {
            lock: Arc::clone(self),
            mode: AccessMode::Counting,
            count: 1,
        }
    }

    pub fn is_held_by(&self, consumer: ConsumerId) -> bool {
        self.state().holders.contains_key(&consumer)
    }

    /// Current holders, in no particular order.
    pub fn holders(&self) -> Vec<ConsumerId> {
        self.state().holders.keys().copied().collect()
    }

    /// Consumers waiting on this lock, first in line first.
    pub fn waiting(&self) -> Vec<ConsumerId> {
        self.state().waiters.iter().map(|w| w.consumer).collect()
    }

    /// Change the max count in place, e.g. on reconfiguration. Holders keep
    /// their claims even if the lock is now over capacity.
    pub fn set_max_count(&self, max_count: u32) {
        let mut state = self.state();
        state.max_count = max_count.max(1);
        state.wake_waiters();
    }

    fn is_available(&self, consumer: ConsumerId, mode: AccessMode, count: u32) -> bool {
        self.state().is_available(consumer, mode, count)
    }

    fn try_claim(&self, consumer: ConsumerId, mode: AccessMode, count: u32) -> bool {
        let mut state = self.state();
        if !state.is_available(consumer, mode, count) {
            return false;
        }
        state.holders.insert(consumer, Holding { mode, count });
        let before = state.waiters.len();
        state.waiters.retain(|w| w.consumer != consumer);
        if state.waiters.len() != before {
            // the waiters behind may now fit too
            state.wake_waiters();
        }
        trace!(lock = %self.name, %consumer, ?mode, count, "lock claimed");
        true
    }

    fn release(&self, consumer: ConsumerId) -> Result<(), LockError> {
        let mut state = self.state();
        if state.holders.remove(&consumer).is_none() {
            return Err(LockError::NotHeld {
                lock: self.name.clone(),
                consumer,
            });
        }
        trace!(lock = %self.name, %consumer, "lock released");
        state.wake_waiters();
        Ok(())
    }

    /// Queue `consumer` behind earlier tickets. Re-queueing keeps the
    /// original position and only swaps the wake handle.
    fn enqueue(
        &self,
        consumer: ConsumerId,
        ticket: u64,
        mode: AccessMode,
        count: u32,
        wake: &Arc<Notify>,
    ) {
        let mut state = self.state();
        if let Some(existing) = state.waiters.iter_mut().find(|w| w.consumer == consumer) {
            existing.wake = Arc::clone(wake);
            return;
        }
        let idx = state.waiters.partition_point(|w| w.ticket <= ticket);
        state.waiters.insert(
            idx,
            Waiter {
                consumer,
                ticket,
                mode,
                count,
                wake: Arc::clone(wake),
            },
        );
        debug!(lock = %self.name, %consumer, position = idx, "waiting for lock");
    }

    fn dequeue(&self, consumer: ConsumerId) {
        let mut state = self.state();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.consumer != consumer);
        if state.waiters.len() != before {
            state.wake_waiters();
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("max_count", &state.max_count)
            .field("holders", &state.holders.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A consumer's way of holding one lock: exclusive, or counting with a
/// number of slots.
#[derive(Debug, Clone)]
pub struct LockAccess {
    lock: Arc<Lock>,
    mode: AccessMode,
    count: u32,
}

impl LockAccess {
    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_available(&self, consumer: ConsumerId) -> bool {
        self.lock.is_available(consumer, self.mode, self.count)
    }

    /// Wait until the lock can be claimed, then claim it.
    pub async fn claim(&self, consumer: ConsumerId) -> Result<(), LockError> {
        LockSet::single(self.clone()).acquire(consumer).await
    }

    /// Give the lock back. Only valid once per successful claim.
    pub fn release(&self, consumer: ConsumerId) -> Result<(), LockError> {
        self.lock.release(consumer)
    }
}

/// Removes a pending acquisition from every queue it joined, including when
/// the acquiring future is dropped.
struct WaitRegistration {
    consumer: ConsumerId,
    locks: Vec<Arc<Lock>>,
}

impl WaitRegistration {
    fn track(&mut self, lock: &Arc<Lock>) {
        if !self.locks.iter().any(|l| Arc::ptr_eq(l, lock)) {
            self.locks.push(Arc::clone(lock));
        }
    }
}

impl Drop for WaitRegistration {
    fn drop(&mut self) {
        for lock in &self.locks {
            lock.dequeue(self.consumer);
        }
    }
}

/// Every lock a build (or step) declares, acquired together.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    accesses: Vec<LockAccess>,
}

impl LockSet {
    pub fn new(accesses: Vec<LockAccess>) -> Result<Self, LockError> {
        for (idx, access) in accesses.iter().enumerate() {
            if accesses[..idx]
                .iter()
                .any(|a| Arc::ptr_eq(&a.lock, &access.lock))
            {
                return Err(LockError::DuplicateAccess(access.lock.name.clone()));
            }
        }
        Ok(Self { accesses })
    }

    pub fn single(access: LockAccess) -> Self {
        Self {
            accesses: vec![access],
        }
    }

    pub fn accesses(&self) -> &[LockAccess] {
        &self.accesses
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    /// Whether every lock could be claimed by `consumer` right now.
    pub fn is_available(&self, consumer: ConsumerId) -> bool {
        self.accesses.iter().all(|a| a.is_available(consumer))
    }

    /// Claim every lock or none, without waiting.
    pub fn try_acquire(&self, consumer: ConsumerId) -> bool {
        for (idx, access) in self.accesses.iter().enumerate() {
            if !access.lock.try_claim(consumer, access.mode, access.count) {
                for claimed in &self.accesses[..idx] {
                    // just claimed above, so this cannot fail
                    let _ = claimed.lock.release(consumer);
                }
                return false;
            }
        }
        true
    }

    /// Claim every lock, waiting as long as needed.
    ///
    /// Nothing is held while waiting: a set whose first lock is free but
    /// whose second is taken holds neither until both can be claimed.
    pub async fn acquire(&self, consumer: ConsumerId) -> Result<(), LockError> {
        if let Some(held) = self.accesses.iter().find(|a| a.lock.is_held_by(consumer)) {
            return Err(LockError::AlreadyHeld {
                lock: held.lock.name.clone(),
                consumer,
            });
        }
        if self.try_acquire(consumer) {
            return Ok(());
        }

        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        let mut registration = WaitRegistration {
            consumer,
            locks: Vec::new(),
        };

        loop {
            let blocked: Vec<&LockAccess> = self
                .accesses
                .iter()
                .filter(|a| !a.is_available(consumer))
                .collect();

            if blocked.is_empty() {
                if self.try_acquire(consumer) {
                    return Ok(());
                }
                continue;
            }

            for access in blocked {
                access
                    .lock
                    .enqueue(consumer, ticket, access.mode, access.count, &wake);
                registration.track(&access.lock);
            }

            // a release between the check and the enqueue has no one to wake
            if self.is_available(consumer) {
                continue;
            }

            wake.notified().await;
        }
    }

    /// Release every lock in the set. All locks are released even if one
    /// of them was not held; the first such error is returned.
    pub fn release(&self, consumer: ConsumerId) -> Result<(), LockError> {
        let mut first_error = None;
        for access in &self.accesses {
            if let Err(e) = access.lock.release(consumer) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn consumer() -> ConsumerId {
        ResourceId::new()
    }

    #[test]
    fn test_exclusive_lock_single_holder() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let (a, b) = (consumer(), consumer());

        assert!(LockSet::single(access.clone()).try_acquire(a));
        assert!(!access.is_available(b));
        assert!(!LockSet::single(access.clone()).try_acquire(b));

        access.release(a).unwrap();
        assert!(access.is_available(b));
    }

    #[test]
    fn test_counting_lock_respects_max_count() {
        let lock = Lock::counting("slots", 2);
        let access = lock.counting_access();
        let (a, b, c) = (consumer(), consumer(), consumer());

        assert!(LockSet::single(access.clone()).try_acquire(a));
        assert!(LockSet::single(access.clone()).try_acquire(b));
        assert!(!LockSet::single(access.clone()).try_acquire(c));
        assert_eq!(lock.holders().len(), 2);
    }

    #[test]
    fn test_exclusive_access_on_counting_lock_needs_it_empty() {
        let lock = Lock::counting("slots", 3);
        let (a, b) = (consumer(), consumer());

        assert!(LockSet::single(lock.counting_access()).try_acquire(a));
        assert!(!lock.exclusive_access().is_available(b));
        lock.counting_access().release(a).unwrap();
        assert!(lock.exclusive_access().is_available(b));
    }

    #[test]
    fn test_access_count_validated() {
        let lock = Lock::counting("slots", 2);
        assert!(lock.access(AccessMode::Counting, 0).is_err());
        assert!(lock.access(AccessMode::Counting, 3).is_err());
        assert_eq!(lock.access(AccessMode::Counting, 2).unwrap().count(), 2);
    }

    #[test]
    fn test_large_counts_do_not_overflow() {
        let lock = Lock::counting("slots", u32::MAX);
        let big = lock.access(AccessMode::Counting, u32::MAX - 1).unwrap();
        let small = lock.access(AccessMode::Counting, 2).unwrap();
        let (a, b) = (consumer(), consumer());

        assert!(LockSet::single(big).try_acquire(a));
        assert!(!small.is_available(b));
        assert!(lock.access(AccessMode::Counting, 1).unwrap().is_available(b));
    }

    #[test]
    fn test_release_only_once() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let a = consumer();

        assert!(LockSet::single(access.clone()).try_acquire(a));
        access.release(a).unwrap();
        assert_eq!(
            access.release(a),
            Err(LockError::NotHeld {
                lock: "db".to_string(),
                consumer: a
            })
        );
    }

    #[test]
    fn test_release_from_non_owner_fails() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let (owner, other) = (consumer(), consumer());

        assert!(LockSet::single(access.clone()).try_acquire(owner));
        assert!(access.release(other).is_err());
        assert!(lock.is_held_by(owner));
    }

    #[test]
    fn test_duplicate_lock_in_set_rejected() {
        let lock = Lock::exclusive("db");
        let result = LockSet::new(vec![lock.exclusive_access(), lock.exclusive_access()]);
        assert!(matches!(result, Err(LockError::DuplicateAccess(name)) if name == "db"));
    }

    #[test]
    fn test_try_acquire_is_all_or_nothing() {
        let l1 = Lock::exclusive("l1");
        let l2 = Lock::counting("l2", 1);
        let (holder, build) = (consumer(), consumer());

        assert!(LockSet::single(l2.counting_access()).try_acquire(holder));

        let set = LockSet::new(vec![l1.exclusive_access(), l2.counting_access()]).unwrap();
        assert!(!set.try_acquire(build));
        assert!(l1.holders().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_set_holds_nothing_until_all_free() {
        let l1 = Lock::exclusive("l1");
        let l2 = Lock::counting("l2", 1);
        let (holder, build) = (consumer(), consumer());

        l2.counting_access().claim(holder).await.unwrap();

        let set = LockSet::new(vec![l1.exclusive_access(), l2.counting_access()]).unwrap();
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.acquire(build).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(l1.holders().is_empty());
        assert_eq!(l2.waiting(), vec![build]);

        l2.counting_access().release(holder).unwrap();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should finish")
            .unwrap()
            .unwrap();

        assert!(l1.is_held_by(build));
        assert!(l2.is_held_by(build));
        assert!(l2.waiting().is_empty());
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let (holder, first, second) = (consumer(), consumer(), consumer());

        access.claim(holder).await.unwrap();

        let first_task = {
            let access = access.clone();
            tokio::spawn(async move { access.claim(first).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second_task = {
            let access = access.clone();
            tokio::spawn(async move { access.claim(second).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock.waiting(), vec![first, second]);

        access.release(holder).unwrap();
        timeout(Duration::from_secs(1), first_task)
            .await
            .expect("first waiter should be granted")
            .unwrap()
            .unwrap();
        assert!(lock.is_held_by(first));
        assert!(!second_task.is_finished());

        access.release(first).unwrap();
        timeout(Duration::from_secs(1), second_task)
            .await
            .expect("second waiter should be granted")
            .unwrap()
            .unwrap();
        assert!(lock.is_held_by(second));
    }

    #[tokio::test]
    async fn test_newcomer_cannot_jump_the_queue() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let (holder, waiter, newcomer) = (consumer(), consumer(), consumer());

        access.claim(holder).await.unwrap();
        let task = {
            let access = access.clone();
            tokio::spawn(async move { access.claim(waiter).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        access.release(holder).unwrap();
        // the queued waiter is ahead of the newcomer, even before it runs
        assert!(!access.is_available(newcomer));

        timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should be granted")
            .unwrap()
            .unwrap();
        assert!(lock.is_held_by(waiter));
    }

    #[tokio::test]
    async fn test_dropped_acquisition_leaves_queue() {
        let lock = Lock::exclusive("db");
        let access = lock.exclusive_access();
        let (holder, quitter, other) = (consumer(), consumer(), consumer());

        access.claim(holder).await.unwrap();
        let set = LockSet::single(access.clone());
        let result = timeout(Duration::from_millis(20), set.acquire(quitter)).await;
        assert!(result.is_err());
        assert!(lock.waiting().is_empty());

        access.release(holder).unwrap();
        assert!(access.is_available(other));
    }

    #[tokio::test]
    async fn test_acquire_twice_is_an_error() {
        let lock = Lock::exclusive("db");
        let a = consumer();
        lock.exclusive_access().claim(a).await.unwrap();
        assert!(matches!(
            lock.exclusive_access().claim(a).await,
            Err(LockError::AlreadyHeld { .. })
        ));
    }

    #[tokio::test]
    async fn test_raising_max_count_wakes_waiters() {
        let lock = Lock::counting("slots", 1);
        let (a, b) = (consumer(), consumer());
        lock.counting_access().claim(a).await.unwrap();

        let task = {
            let access = lock.counting_access();
            tokio::spawn(async move { access.claim(b).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        lock.set_max_count(2);
        timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should be granted after reconfiguration")
            .unwrap()
            .unwrap();
        assert_eq!(lock.holders().len(), 2);
    }
}
