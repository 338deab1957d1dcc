// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recursive mutexes.
//!
//! A mutex is a binary semaphore with an owner and a lock count layered on
//! top. The owner may re-acquire freely; each release unwinds one level, and
//! the release that reaches zero returns the token and surfaces the next
//! waiter through the underlying semaphore. This is mutual exclusion only —
//! there is no priority adjustment here; starvation relief is the
//! scheduler's group-promotion pass.
//!
//! Invariant: `lock_count > 0` exactly when an owner is recorded.

use abi::TaskId;

use crate::sched::ParkContext;
use crate::sem::{SemError, Semaphore};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MutexError {
    /// The mutex is held by a different task. On the blocking acquire path
    /// the caller is now in the waiter list.
    OwnedByOtherTask,
    /// The owner/lock-count invariant broke. State corruption.
    MissingOwner,
    /// The underlying semaphore failed.
    Sem(SemError),
}

impl MutexError {
    pub const fn reason(self) -> u32 {
        match self {
            MutexError::OwnedByOtherTask => 1,
            MutexError::MissingOwner => 2,
            MutexError::Sem(e) => 8 | e.reason(),
        }
    }
}

pub struct Mutex {
    pub(crate) semaphore: Semaphore,
    owner: Option<TaskId>,
    lock_count: usize,
}

impl Mutex {
    pub fn new(id: usize) -> Self {
        Self {
            semaphore: Semaphore::new(id, Semaphore::BINARY),
            owner: None,
            lock_count: 0,
        }
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    pub fn waiter_count(&self) -> usize {
        self.semaphore.waiter_count()
    }

    fn check(&self) -> Result<(), MutexError> {
        if (self.lock_count > 0) != self.owner.is_some() {
            return Err(MutexError::MissingOwner);
        }
        Ok(())
    }

    /// Acquires or re-enters the lock. A non-owner finding the lock held is
    /// parked in the waiter list and gets `OwnedByOtherTask`; the scheduler
    /// facade turns that into blocking and retries after wake-up.
    pub fn acquire(&mut self, ctx: ParkContext<'_>) -> Result<(), MutexError> {
        self.check()?;
        if self.owner == Some(ctx.caller) {
            self.lock_count += 1;
            return Ok(());
        }
        // The semaphore covers both remaining cases: free (token available)
        // and held by someone else (no token, caller parked).
        let caller = ctx.caller;
        match self.semaphore.acquire(ctx) {
            Ok(()) => {
                self.owner = Some(caller);
                self.lock_count = 1;
                Ok(())
            }
            Err(SemError::NoTokens) => Err(MutexError::OwnedByOtherTask),
            Err(e) => Err(MutexError::Sem(e)),
        }
    }

    /// Unwinds one acquire. Only the owner may release; the final release
    /// clears ownership and surfaces the oldest waiter for re-readying.
    pub fn release(&mut self, caller: TaskId) -> Result<Option<TaskId>, MutexError> {
        self.check()?;
        if self.owner != Some(caller) {
            return Err(MutexError::OwnedByOtherTask);
        }
        let mut released = None;
        if self.lock_count == 1 {
            released = self.semaphore.release().map_err(MutexError::Sem)?;
            self.owner = None;
        }
        self.lock_count -= 1;
        Ok(released)
    }

    /// Acquire variant that never parks the caller.
    pub fn acquire_non_blocking(&mut self, caller: TaskId) -> Result<(), MutexError> {
        self.check()?;
        match self.owner {
            None => {
                self.semaphore
                    .acquire_non_blocking()
                    .map_err(MutexError::Sem)?;
                self.owner = Some(caller);
                self.lock_count = 1;
                Ok(())
            }
            Some(o) if o == caller => {
                self.lock_count += 1;
                Ok(())
            }
            Some(_) => Err(MutexError::OwnedByOtherTask),
        }
    }

    /// Release variant that never consults the waiter list.
    pub fn release_non_blocking(&mut self, caller: TaskId) -> Result<(), MutexError> {
        self.check()?;
        if self.owner != Some(caller) {
            return Err(MutexError::OwnedByOtherTask);
        }
        if self.lock_count == 1 {
            self.semaphore
                .release_non_blocking()
                .map_err(MutexError::Sem)?;
            self.owner = None;
        }
        self.lock_count -= 1;
        Ok(())
    }
}
