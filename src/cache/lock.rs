//! Key Lock Manager
//!
//! Grants at most one in-flight build per (type, key).
//!
//! # State machine
//!
//! ```text
//! Unlocked ──acquire──▶ Building ──guard dropped──▶ Unlocked
//!                          │
//!                          └── factory error / panic ──▶ Unlocked
//! ```
//!
//! Every thread keeps a stack of the slots it holds. A context asking for a
//! key already on its stack gets [`Error::Reentrance`] immediately, however
//! deep the chain of nested builds that led back to it; any other context
//! waits until the owner releases the slot, or until its own timeout expires
//! ([`Error::LockTimeout`]).
//!
//! Each waiting context is recorded in a waits-for table. When a wait times
//! out and the owner it waited on is itself waiting, directly or through a
//! chain, on a slot the timed-out context holds, every context in that chain
//! is cancelled with [`Error::LockTimeout`] as well. A circular wait therefore
//! fails on all sides once any participant's timeout expires. Without any
//! timeout a circular wait blocks forever.
//!
//! The slot table mutex is held only to look up, insert or remove a slot.
//! Waiting happens on the slot's own condvar, so waiters on one key never
//! delay acquisition of another.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::debug;

use super::key::{CacheKey, SlotKey, TypeInfo};
use crate::error::{Error, Result};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_MANAGER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: ContextId = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
    /// (manager id, slot) for every build lock this thread holds
    static HELD: RefCell<Vec<(u64, SlotKey)>> = const { RefCell::new(Vec::new()) };
}

fn holds(manager: u64, key: &SlotKey) -> bool {
    HELD.with(|held| held.borrow().iter().any(|(m, k)| *m == manager && k == key))
}

fn push_held(manager: u64, key: &SlotKey) {
    HELD.with(|held| held.borrow_mut().push((manager, key.clone())));
}

fn pop_held(manager: u64, key: &SlotKey) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|(m, k)| *m == manager && k == key) {
            held.remove(pos);
        }
    });
}

/// Identity of a call context; one per thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Context of the calling thread
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(|id| *id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Number of build locks the calling thread holds
    pub fn held_count() -> usize {
        HELD.with(|held| held.borrow().len())
    }
}

/// Build lock for one (type, key)
#[derive(Debug)]
struct LockSlot {
    type_info: TypeInfo,
    owner: ContextId,
    timeout: Option<Duration>,
    acquired_at: Instant,
    state: Mutex<SlotState>,
    cond: Condvar,
    waiters: AtomicUsize,
}

#[derive(Debug, Default)]
struct SlotState {
    released: bool,
    /// Waiters told to give up because they sit in a broken cycle
    cancelled: Vec<ContextId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Released,
    TimedOut,
    Cancelled,
}

impl LockSlot {
    fn new(type_info: TypeInfo, owner: ContextId, timeout: Option<Duration>) -> Self {
        Self {
            type_info,
            owner,
            timeout,
            acquired_at: Instant::now(),
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Block until released, cancelled, or past the deadline
    fn wait_released(&self, me: ContextId, deadline: Option<Instant>) -> WaitOutcome {
        let mut state = self.state.lock();
        self.waiters.fetch_add(1, Ordering::Relaxed);

        let mut expired = false;
        let outcome = loop {
            if let Some(pos) = state.cancelled.iter().position(|c| *c == me) {
                state.cancelled.swap_remove(pos);
                break WaitOutcome::Cancelled;
            }
            if state.released {
                break WaitOutcome::Released;
            }
            if expired {
                break WaitOutcome::TimedOut;
            }
            match deadline {
                Some(deadline) => {
                    expired = self.cond.wait_until(&mut state, deadline).timed_out();
                }
                None => self.cond.wait(&mut state),
            }
        };

        self.waiters.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    fn cancel(&self, waiter: ContextId) {
        self.state.lock().cancelled.push(waiter);
        self.cond.notify_all();
    }

    /// Drop a cancellation that arrived after the waiter already left
    fn forget(&self, waiter: ContextId) {
        self.state.lock().cancelled.retain(|c| *c != waiter);
    }

    fn release(&self) {
        self.state.lock().released = true;
        self.cond.notify_all();
    }
}

/// Lock table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockCounters {
    pub acquired: u64,
    pub timeouts: u64,
    pub reentrances: u64,
    /// Waits cancelled because another participant of a circular wait timed out
    pub cycles_broken: u64,
}

/// Key currently held by a build
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub type_info: TypeInfo,
    pub key: CacheKey,
    pub owner: ContextId,
}

/// Per-(type, key) build lock table
#[derive(Debug)]
pub struct KeyLockManager {
    id: u64,
    slots: Mutex<HashMap<SlotKey, Arc<LockSlot>>>,
    /// Slot each blocked context is waiting on
    waiting: Mutex<HashMap<ContextId, Arc<LockSlot>>>,
    acquired: AtomicU64,
    timeouts: AtomicU64,
    reentrances: AtomicU64,
    cycles_broken: AtomicU64,
}

impl Default for KeyLockManager {
    fn default() -> Self {
        Self {
            id: NEXT_MANAGER.fetch_add(1, Ordering::Relaxed),
            slots: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            acquired: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            reentrances: AtomicU64::new(0),
            cycles_broken: AtomicU64::new(0),
        }
    }
}

impl KeyLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the build lock for (type, key), waiting up to `timeout`
    pub fn acquire(
        &self,
        type_info: TypeInfo,
        key: &CacheKey,
        timeout: Option<Duration>,
    ) -> Result<KeyLockGuard<'_>> {
        let me = ContextId::current();
        let slot_key = SlotKey::new(type_info, key.clone());
        let deadline = timeout.map(|t| Instant::now() + t);

        if holds(self.id, &slot_key) {
            self.reentrances.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Reentrance {
                type_name: type_info.name().to_string(),
                key: key.joined(),
            });
        }

        loop {
            let slot = {
                let mut slots = self.slots.lock();
                match slots.get(&slot_key) {
                    None => {
                        let slot = Arc::new(LockSlot::new(type_info, me, timeout));
                        slots.insert(slot_key.clone(), Arc::clone(&slot));
                        self.acquired.fetch_add(1, Ordering::Relaxed);
                        push_held(self.id, &slot_key);
                        return Ok(KeyLockGuard {
                            manager: self,
                            key: slot_key,
                            slot,
                        });
                    }
                    Some(slot) => Arc::clone(slot),
                }
            };

            debug!(
                type_name = type_info.name(),
                key = %key,
                owner = slot.owner.as_u64(),
                held_for_ms = slot.acquired_at.elapsed().as_millis() as u64,
                "waiting for in-flight build"
            );

            self.waiting.lock().insert(me, Arc::clone(&slot));
            let outcome = slot.wait_released(me, deadline);
            self.waiting.lock().remove(&me);
            slot.forget(me);

            match outcome {
                WaitOutcome::Released => continue,
                WaitOutcome::TimedOut => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.break_cycle(me, &slot);
                }
                WaitOutcome::Cancelled => {
                    self.cycles_broken.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        type_name = type_info.name(),
                        key = %key,
                        "wait cancelled, circular wait timed out elsewhere"
                    );
                }
            }
            return Err(Error::LockTimeout {
                type_name: type_info.name().to_string(),
                key: key.joined(),
                timeout: timeout.unwrap_or_default(),
            });
        }
    }

    /// Cancel the waits that close a cycle back to `me`.
    ///
    /// Follows the waits-for chain starting at the owner of `blocked`; if it
    /// leads back to `me`, every context on the chain is woken with a
    /// cancellation. Cancellations are pushed while the waits-for table is
    /// locked, so a context that already left its wait never receives one.
    fn break_cycle(&self, me: ContextId, blocked: &LockSlot) {
        let waiting = self.waiting.lock();
        let mut chain: Vec<(ContextId, &Arc<LockSlot>)> = Vec::new();
        let mut owner = blocked.owner;

        while owner != me {
            let Some(slot) = waiting.get(&owner) else {
                return;
            };
            if chain.iter().any(|(ctx, _)| *ctx == owner) {
                return;
            }
            chain.push((owner, slot));
            owner = slot.owner;
        }

        for (ctx, slot) in &chain {
            slot.cancel(*ctx);
        }
        debug!(
            type_name = blocked.type_info.name(),
            contexts = chain.len() + 1,
            "broke circular wait"
        );
    }

    /// Acquire without waiting; None if another build holds the key
    pub fn try_acquire(&self, type_info: TypeInfo, key: &CacheKey) -> Option<KeyLockGuard<'_>> {
        let slot_key = SlotKey::new(type_info, key.clone());
        let mut slots = self.slots.lock();
        if slots.contains_key(&slot_key) {
            return None;
        }

        let slot = Arc::new(LockSlot::new(type_info, ContextId::current(), None));
        slots.insert(slot_key.clone(), Arc::clone(&slot));
        self.acquired.fetch_add(1, Ordering::Relaxed);
        push_held(self.id, &slot_key);
        Some(KeyLockGuard {
            manager: self,
            key: slot_key,
            slot,
        })
    }

    fn release(&self, key: &SlotKey, slot: &Arc<LockSlot>) {
        {
            let mut slots = self.slots.lock();
            if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
                slots.remove(key);
            }
        }
        slot.release();
    }

    /// Whether a build currently holds (type, key)
    pub fn is_locked(&self, type_info: TypeInfo, key: &CacheKey) -> bool {
        self.slots
            .lock()
            .contains_key(&SlotKey::new(type_info, key.clone()))
    }

    /// Number of contexts waiting on (type, key)
    pub fn waiters(&self, type_info: TypeInfo, key: &CacheKey) -> usize {
        self.slots
            .lock()
            .get(&SlotKey::new(type_info, key.clone()))
            .map(|slot| slot.waiters.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of keys currently being built
    pub fn active_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Snapshot of every held key with its owner
    pub fn active_keys(&self) -> Vec<ActiveKey> {
        self.slots
            .lock()
            .iter()
            .map(|(slot_key, slot)| ActiveKey {
                type_info: slot.type_info,
                key: slot_key.key.clone(),
                owner: slot.owner,
            })
            .collect()
    }

    pub fn counters(&self) -> LockCounters {
        LockCounters {
            acquired: self.acquired.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reentrances: self.reentrances.load(Ordering::Relaxed),
            cycles_broken: self.cycles_broken.load(Ordering::Relaxed),
        }
    }
}

/// Held build lock; released on drop, including during unwinding
#[must_use = "the build lock is released as soon as the guard is dropped"]
pub struct KeyLockGuard<'a> {
    manager: &'a KeyLockManager,
    key: SlotKey,
    slot: Arc<LockSlot>,
}

impl KeyLockGuard<'_> {
    /// Locked key
    pub fn key(&self) -> &CacheKey {
        &self.key.key
    }

    /// Timeout the owner requested when acquiring
    pub fn timeout(&self) -> Option<Duration> {
        self.slot.timeout
    }
}

impl std::fmt::Debug for KeyLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key.key)
            .field("owner", &self.slot.owner)
            .finish()
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        pop_held(self.manager.id, &self.key);
        self.manager.release(&self.key, &self.slot);
    }
}

// =============================================================================
// Tests
// =============================================================================
