// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A [`Task`] is the unit of scheduling: control state, a fixed native
//! stack, the event register and the message rendezvous buffer, all inline
//! so the whole kernel is one statically allocated value. Tasks are created
//! by `add_task` and live in the scheduler's task table for the life of the
//! kernel; the synthetic entry frame is written onto the stack by
//! `arch::initialize_stack` once the table has reached its final address.

use abi::{
    BlockCause, EventFilter, EventSet, Priority, TaskId, TaskState,
    MAX_MESSAGE_SIZE, STACK_WORDS, TASK_NAME_LEN,
};

use crate::trace;

/// Signature of a task entry function. The returned word becomes the task's
/// exit code when it lands in the terminate trampoline.
pub type TaskEntry = fn() -> u32;

/// Which kernel-owned parking list currently holds a task, for the two
/// lists the event machinery must tell apart. `None` for tasks that are
/// ready, running, or waiting on a primitive's own list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParkList {
    /// The cumulative-delta delay list.
    Delayed,
    /// The blocked-on-events list (event wait without timeout).
    Events,
}

/// Per-task event state: which bits the task cares about, which have
/// arrived, an optional filter run at send time, and the timeout used by
/// `event_receive_timeout`.
#[derive(Copy, Clone)]
pub struct EventRegister {
    pub wanted: EventSet,
    pub received: EventSet,
    pub filter: Option<EventFilter>,
    pub timeout: u32,
}

/// Task stacks must be 8-byte aligned for AAPCS; a `[u32]` alone only
/// guarantees 4.
#[repr(align(8))]
pub struct TaskStack(pub [u32; STACK_WORDS]);

/// Everything `add_task` needs to describe a task.
pub struct TaskConfig<'a> {
    pub entry: TaskEntry,
    pub id: TaskId,
    pub name: &'a str,
    pub priority: Priority,
    pub quantum: u32,
    pub wanted_events: EventSet,
    pub event_filter: Option<EventFilter>,
    pub event_timeout: u32,
}

/// Internal representation of a task.
///
/// Fields are private to this module so the state/trace pairing and the
/// rendezvous flag discipline can't be bypassed from elsewhere; the
/// scheduler and the architecture layer go through the accessors below.
pub struct Task {
    id: TaskId,
    name: [u8; TASK_NAME_LEN],
    name_len: u8,
    priority: Priority,
    state: TaskState,
    entry: TaskEntry,
    stack: TaskStack,
    /// Process stack pointer as of the last time this task was switched
    /// out, or the synthetic start value.
    saved_sp: u32,
    quantum: u32,
    quantum_remaining: u32,
    /// Ticks remaining after the predecessor in the delay list.
    delta: u32,
    cause: Option<BlockCause>,
    events: EventRegister,
    /// Direct-delivery rendezvous buffer: a sender may copy a payload here
    /// while this task is parked in a queue's receiver list.
    message: [u8; MAX_MESSAGE_SIZE],
    message_len: usize,
    message_set: bool,
    parked_in: Option<ParkList>,
    exit_code: u32,
}

impl Task {
    /// Creates a task in its initial state. The stack is zeroed; the entry
    /// frame is the architecture layer's business at start time.
    pub fn create(config: &TaskConfig<'_>) -> Self {
        let mut name = [0; TASK_NAME_LEN];
        let len = config.name.len().min(TASK_NAME_LEN);
        name[..len].copy_from_slice(&config.name.as_bytes()[..len]);

        let mut task = Self {
            id: config.id,
            name,
            name_len: len as u8,
            priority: config.priority,
            state: TaskState::Created,
            entry: config.entry,
            stack: TaskStack([0; STACK_WORDS]),
            saved_sp: 0,
            quantum: config.quantum,
            quantum_remaining: 0,
            delta: 0,
            cause: None,
            events: EventRegister {
                wanted: config.wanted_events,
                received: EventSet::EMPTY,
                filter: config.event_filter,
                timeout: config.event_timeout,
            },
            message: [0; MAX_MESSAGE_SIZE],
            message_len: 0,
            message_set: false,
            parked_in: None,
            exit_code: 0,
        };
        task.set_state(TaskState::Created);
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Assigns the state and emits the matching trace event. The blocked
    /// cause reported on ready-end is whatever `set_cause` recorded last.
    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
        match state {
            TaskState::Created => trace::event_task_create(self.id),
            TaskState::Ready => trace::event_task_ready_begin(self.id),
            TaskState::Running => trace::event_task_exec_begin(self.id),
            TaskState::Blocked => trace::event_task_ready_end(
                self.id,
                self.cause.map(BlockCause::code).unwrap_or(0),
            ),
            TaskState::Terminated => trace::event_task_exec_end(self.id),
        }
    }

    pub(crate) fn set_cause(&mut self, cause: BlockCause) {
        self.cause = Some(cause);
    }

    pub fn quantum_remaining(&self) -> u32 {
        self.quantum_remaining
    }

    pub(crate) fn reset_quantum(&mut self) {
        self.quantum_remaining = self.quantum;
    }

    pub(crate) fn consume_quantum(&mut self) {
        if self.quantum_remaining > 0 {
            self.quantum_remaining -= 1;
        }
    }

    pub(crate) fn delta(&self) -> u32 {
        self.delta
    }

    pub(crate) fn set_delta(&mut self, delta: u32) {
        self.delta = delta;
    }

    pub(crate) fn events(&self) -> &EventRegister {
        &self.events
    }

    pub(crate) fn events_mut(&mut self) -> &mut EventRegister {
        &mut self.events
    }

    pub(crate) fn parked_in(&self) -> Option<ParkList> {
        self.parked_in
    }

    pub(crate) fn set_parked_in(&mut self, park: Option<ParkList>) {
        self.parked_in = park;
    }

    /// Copies a payload into the rendezvous buffer and raises the flag. The
    /// next `receive` by this task consumes it without touching the ring.
    pub(crate) fn deposit_message(&mut self, payload: &[u8]) {
        uassert!(payload.len() <= MAX_MESSAGE_SIZE);
        self.message[..payload.len()].copy_from_slice(payload);
        self.message_len = payload.len();
        self.message_set = true;
    }

    pub(crate) fn message_set(&self) -> bool {
        self.message_set
    }

    /// Consumes the rendezvous buffer, lowering the flag.
    pub(crate) fn take_message(&mut self, out: &mut [u8]) {
        uassert!(self.message_set);
        uassert!(out.len() >= self.message_len);
        out[..self.message_len].copy_from_slice(&self.message[..self.message_len]);
        self.message_set = false;
        self.message_len = 0;
    }

    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    pub(crate) fn set_exit_code(&mut self, code: u32) {
        self.exit_code = code;
    }

    /// Machine address of the entry function, for the synthetic frame.
    pub(crate) fn entry_point(&self) -> usize {
        self.entry as usize
    }

    pub(crate) fn stack_mut(&mut self) -> &mut [u32; STACK_WORDS] {
        &mut self.stack.0
    }

    pub fn saved_sp(&self) -> u32 {
        self.saved_sp
    }

    pub(crate) fn set_saved_sp(&mut self, sp: u32) {
        self.saved_sp = sp;
    }
}
