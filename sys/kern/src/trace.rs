// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel trace event support.
//!
//! The kernel narrates scheduling activity as a small set of enumerated
//! events. Because the kernel is SoC-independent it does not assume any
//! particular way of getting these events off the chip; a board that wants
//! them populates a [`TraceSink`] with function pointers and hands it to
//! [`configure_trace_sink`] during bring-up. A typical sink forwards to a
//! system-view style analyzer over ITM or RTT. With no sink configured,
//! every event is a cheap null-check and the kernel behaves identically —
//! the null sink is a compliant sink.
//!
//! Keep sink functions short: several of these fire from the tick ISR.

use abi::TaskId;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks a trace-capable board provides. If you provide a `TraceSink` you
/// have to provide every hook; stub unwanted ones with `|_| ()` or `|| ()`.
pub struct TraceSink {
    /// A task was registered.
    pub task_create: fn(TaskId),
    /// A task became ready to run.
    pub task_ready_begin: fn(TaskId),
    /// A task was handed the CPU.
    pub task_exec_begin: fn(TaskId),
    /// A task stopped being ready; the second argument is the block cause
    /// code (see `abi::BlockCause`).
    pub task_ready_end: fn(TaskId, u32),
    /// A task stopped executing for good.
    pub task_exec_end: fn(TaskId),
    /// The scheduler found nothing runnable.
    pub system_idle: fn(),
    /// The tick ISR was entered.
    pub tick_isr_enter: fn(),
    /// The tick ISR is about to return.
    pub tick_isr_exit: fn(),
}

/// Supplies the kernel with a trace sink.
///
/// Calling this more than once is allowed; the newest sink wins.
pub fn configure_trace_sink(sink: &'static TraceSink) {
    TRACE_SINK.store(sink as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_trace_sink`. Null means no sink.
///
/// All accesses use `Relaxed` ordering: the pointer is written once during
/// bring-up and read many times, and memory barriers have non-zero cost.
static TRACE_SINK: AtomicPtr<TraceSink> = AtomicPtr::new(core::ptr::null_mut());

fn sink() -> Option<&'static TraceSink> {
    let p = TRACE_SINK.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only ever store a valid `&'static`, and we hand out a shared
        // reference, so this is ok.
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_task_create(id: TaskId) {
    if let Some(t) = sink() {
        (t.task_create)(id)
    }
}

pub(crate) fn event_task_ready_begin(id: TaskId) {
    if let Some(t) = sink() {
        (t.task_ready_begin)(id)
    }
}

pub(crate) fn event_task_exec_begin(id: TaskId) {
    if let Some(t) = sink() {
        (t.task_exec_begin)(id)
    }
}

pub(crate) fn event_task_ready_end(id: TaskId, cause: u32) {
    if let Some(t) = sink() {
        (t.task_ready_end)(id, cause)
    }
}

pub(crate) fn event_task_exec_end(id: TaskId) {
    if let Some(t) = sink() {
        (t.task_exec_end)(id)
    }
}

pub(crate) fn event_system_idle() {
    if let Some(t) = sink() {
        (t.system_idle)()
    }
}

pub(crate) fn event_tick_isr_enter() {
    if let Some(t) = sink() {
        (t.tick_isr_enter)()
    }
}

pub(crate) fn event_tick_isr_exit() {
    if let Some(t) = sink() {
        (t.tick_isr_exit)()
    }
}
