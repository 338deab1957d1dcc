// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! This port exists so the portable parts of the kernel — lists, primitives
//! and the whole scheduler state machine — can be unit-tested on the
//! development machine. It performs no context switches and runs no task
//! code: `pend_context_switch` latches a flag the tests inspect with
//! [`take_pending_switch`], and the tests call `Sched::context_switch`
//! themselves to emulate the trap firing.
//!
//! State here is thread-local so `cargo test`'s parallel test threads don't
//! see each other's switch requests.

use abi::TaskId;

use crate::task::Task;

macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        assert_eq!($left, $right)
    };
}

std::thread_local! {
    static CURRENT_TASK: core::cell::Cell<Option<TaskId>> =
        const { core::cell::Cell::new(None) };
    static SWITCH_PENDING: core::cell::Cell<bool> =
        const { core::cell::Cell::new(false) };
}

pub fn disable_interrupts() {}

pub fn enable_interrupts() {}

pub fn pend_context_switch() {
    SWITCH_PENDING.with(|p| p.set(true));
}

/// Test support: reports whether a switch has been requested since the last
/// call, and clears the latch.
pub fn take_pending_switch() -> bool {
    SWITCH_PENDING.with(|p| p.replace(false))
}

pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(|c| c.get())
}

pub(crate) fn set_current_task(id: TaskId) {
    CURRENT_TASK.with(|c| c.set(Some(id)));
}

pub(crate) fn clear_current_task() {
    CURRENT_TASK.with(|c| c.set(None));
}

/// On hardware this spins until the trap resumes `id`; with no trap there
/// is nothing to wait for.
pub fn wait_until_current(_id: TaskId) {}

pub fn wait_while_status(_status: u32) {}

pub fn wait_for_interrupt() {}

/// There is no exception frame to build; tasks never execute on this port.
pub fn initialize_stack(task: &mut Task) {
    task.set_saved_sp(0);
}

pub fn install_vectors() {}

pub fn set_tick_divisor(_cycles_per_tick: u32) {}

pub fn enter_first_task() -> ! {
    panic!("task execution is not supported on the hosted port");
}

pub fn shutdown() -> ! {
    panic!("SYSTEM SHUTDOWN");
}
