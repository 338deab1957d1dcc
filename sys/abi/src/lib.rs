// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.
//!
//! Everything in here is deliberately small and `Copy`: these types cross the
//! facade boundary and occasionally get byte-copied into trace records, so
//! they must not grow interior pointers or padding surprises.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum number of tasks that can be registered with one kernel instance.
///
/// Task ids are dense indices below this value.
pub const MAX_TASKS: usize = 64;

/// Number of priority levels. One ready list ("priority group") exists per
/// level until start-time compaction deletes the unused ones.
pub const MAX_PRIORITIES: usize = MAX_TASKS;

/// Capacity of the semaphore registry.
pub const MAX_SEMAPHORES: usize = 8;

/// Capacity of the mutex registry.
pub const MAX_MUTEXES: usize = 8;

/// Capacity of the message queue registry.
pub const MAX_QUEUES: usize = 8;

/// Queue depth used when an application passes zero to `mq_create`.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Bytes of payload storage backing each message queue ring. A queue's
/// `depth * element_size` must fit in here.
pub const QUEUE_STORAGE_BYTES: usize = 256;

/// Largest message payload a queue can carry; also the size of each task's
/// direct-delivery rendezvous buffer.
pub const MAX_MESSAGE_SIZE: usize = 32;

/// Bytes reserved for a task's display name.
pub const TASK_NAME_LEN: usize = 32;

/// Words in each task stack. The stack base is 8-byte aligned, so keep this
/// even.
pub const STACK_WORDS: usize = 128;

/// Kernel tick rate. One tick is one millisecond.
pub const TICK_HZ: u32 = 1_000;

/// Names a task. Tasks are identified by dense small integers assigned by
/// the application at registration time; the id doubles as the index into
/// the kernel's task table.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// Extracts this id as a table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Default,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Extracts this priority as a group index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Lifecycle state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Registered but not yet made runnable by `start`.
    Created,
    /// In some priority group, waiting for the CPU.
    Ready,
    /// The single task currently executing.
    Running,
    /// Parked in a wait list, the delay list, or the blocked-on-events list.
    Blocked,
    /// Returned from its entry function; parked in the terminated list.
    Terminated,
}

/// Why a task most recently left the Ready state. Carried on the trace
/// ready-end event so an external viewer can tell a semaphore block from a
/// plain delay.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockCause {
    Delay,
    Semaphore,
    Mutex,
    QueueSend,
    QueueReceive,
    Events,
}

impl BlockCause {
    /// Numeric code for trace sinks.
    pub const fn code(self) -> u32 {
        match self {
            BlockCause::Delay => 1,
            BlockCause::Semaphore => 2,
            BlockCause::Mutex => 3,
            BlockCause::QueueSend => 4,
            BlockCause::QueueReceive => 5,
            BlockCause::Events => 6,
        }
    }
}

/// Overall kernel status, visible to debuggers through a mirrored status
/// word. The scheduler enforces the legal transitions; an illegal transition
/// lands in `Error` and stays there.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelStatus {
    NotInitialized,
    Starting,
    Running,
    Idle,
    Error,
}

impl KernelStatus {
    /// Numeric form of the status, mirrored into a word a debugger can watch.
    pub const fn code(self) -> u32 {
        match self {
            KernelStatus::NotInitialized => 0,
            KernelStatus::Starting => 1,
            KernelStatus::Running => 2,
            KernelStatus::Idle => 3,
            KernelStatus::Error => 4,
        }
    }
}

/// Collection of event bits, as held in a task's event register and passed
/// to `event_send`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct EventSet(pub u32);

impl EventSet {
    pub const EMPTY: Self = Self(0);

    /// ORs `other` into this set.
    pub fn insert(&mut self, other: EventSet) {
        self.0 |= other.0;
    }

    /// Removes every bit of `other` from this set.
    pub fn clear(&mut self, other: EventSet) {
        self.0 &= !other.0;
    }

    /// True when every bit of `wanted` is present. An empty `wanted` set is
    /// trivially satisfied.
    pub fn satisfies(self, wanted: EventSet) -> bool {
        self.0 & wanted.0 == wanted.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Signature of the optional per-task event filter. Invoked by `event_send`
/// with the (mutable) received set and the wanted set; the filter may clear
/// bits to suppress a wake-up.
pub type EventFilter = fn(&mut EventSet, EventSet);

bitflags::bitflags! {
    /// Options for message queue send operations.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SendOptions: u32 {
        /// Append at the consumer side of the ring, so the message is
        /// delivered before anything already queued.
        const URGENT = 1 << 0;
    }
}
