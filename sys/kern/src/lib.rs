// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Swarm kernel.
//!
//! This is a preemptive, priority-based multitasking kernel for single-core
//! Cortex-M parts. A fixed set of tasks is registered before start; the
//! scheduler time-slices them with per-group round-robin and blocks them on
//! counting semaphores, recursive mutexes, bounded message queues, event
//! registers and delays. A periodic group-promotion pass keeps low-priority
//! tasks from starving under steady high-priority load.
//!
//! Code outside the `arch` module is portable; it is exercised two ways:
//!
//! - on the target, where `arch::arm_m` performs real context switches
//!   through a PendSV trap and a SysTick-driven tick;
//! - on the development host, where `arch::fake` records switch requests and
//!   the unit tests drive the scheduler state machine by hand.
//!
//! # Design principles
//!
//! 1. Static configuration. Capacities are compile-time constants in `abi`;
//!    there is no allocator and no dynamic task creation after start.
//! 2. A strong preference for safe code where reasonable. The unavoidable
//!    unsafety (register swap, vector install, the kernel cell) is confined
//!    to `arch` and `startup`.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Lists are walked, not hashed; the scheduler scans.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod err;
pub mod kernel;
pub mod list;
pub mod mq;
pub mod mutex;
pub mod ring;
pub mod sched;
pub mod sem;
pub mod startup;
pub mod table;
pub mod task;
pub mod trace;

mod util;
