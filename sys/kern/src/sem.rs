// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! A semaphore is a token counter plus a FIFO waiter list. The blocking
//! acquire does not itself perform a context switch: when no token is
//! available it moves the calling task from its ready group into the waiter
//! list and reports [`SemError::NoTokens`], leaving the switch to the
//! scheduler facade. Symmetrically, `release` surfaces the oldest waiter
//! *without removing it* — the scheduler wrapper transfers the task back to
//! its priority group, so list membership stays single-owner throughout.

use abi::TaskId;

use crate::list::{self, LinkTable, ListError, TaskList};
use crate::sched::ParkContext;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemError {
    /// No token available; on the blocking path the caller is now in the
    /// waiter list.
    NoTokens,
    /// The token count is already at its maximum.
    ReachedMax,
    /// The token count exceeds the maximum. State corruption.
    TokenOverflow,
    /// A waiter-list operation failed.
    List(ListError),
}

impl SemError {
    pub const fn reason(self) -> u32 {
        match self {
            SemError::NoTokens => 1,
            SemError::ReachedMax => 2,
            SemError::TokenOverflow => 3,
            SemError::List(e) => 8 | e.reason(),
        }
    }
}

impl From<ListError> for SemError {
    fn from(e: ListError) -> Self {
        SemError::List(e)
    }
}

pub struct Semaphore {
    id: usize,
    tokens: usize,
    max_tokens: usize,
    pub(crate) waiters: TaskList,
}

impl Semaphore {
    /// Number of tokens a binary semaphore carries.
    pub const BINARY: usize = 1;

    /// Creates a semaphore with `tokens` available, which is also its
    /// maximum.
    pub fn new(id: usize, tokens: usize) -> Self {
        Self {
            id,
            tokens,
            max_tokens: tokens,
            waiters: TaskList::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    fn check(&self) -> Result<(), SemError> {
        if self.tokens > self.max_tokens {
            return Err(SemError::TokenOverflow);
        }
        Ok(())
    }

    /// Takes a token, or parks the calling task in the waiter list and
    /// reports `NoTokens`. The caller is blocked after the error return and
    /// must yield to the scheduler.
    pub fn acquire(&mut self, ctx: ParkContext<'_>) -> Result<(), SemError> {
        self.check()?;
        if self.tokens == 0 {
            list::transfer(&mut self.waiters, ctx.ready, ctx.links, ctx.caller)?;
            return Err(SemError::NoTokens);
        }
        self.tokens -= 1;
        Ok(())
    }

    /// Returns a token. Surfaces the oldest waiter, if any, for the caller
    /// to move back to its priority group; the waiter stays in the waiter
    /// list until that happens.
    pub fn release(&mut self) -> Result<Option<TaskId>, SemError> {
        self.check()?;
        if self.tokens >= self.max_tokens {
            return Err(SemError::ReachedMax);
        }
        self.tokens += 1;
        Ok(self.waiters.front())
    }

    /// Takes a token without any waiter-list interaction.
    pub fn acquire_non_blocking(&mut self) -> Result<(), SemError> {
        self.check()?;
        if self.tokens == 0 {
            return Err(SemError::NoTokens);
        }
        self.tokens -= 1;
        Ok(())
    }

    /// Returns a token without consulting the waiter list.
    pub fn release_non_blocking(&mut self) -> Result<(), SemError> {
        self.check()?;
        if self.tokens >= self.max_tokens {
            return Err(SemError::ReachedMax);
        }
        self.tokens += 1;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.tokens > 0
    }

    /// Drops every waiter from the list. Callers must have returned the
    /// waiting tasks to a ready list first; this only severs the links.
    pub fn flush(&mut self, links: &mut LinkTable) -> Result<(), SemError> {
        while !self.waiters.is_empty() {
            self.waiters.pop_front(links)?;
        }
        Ok(())
    }
}
