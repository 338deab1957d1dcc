// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel storage, access discipline, and failure visibility.
//!
//! The entire kernel — task table, stacks, registries, scheduler cursor —
//! is one statically allocated [`Kernel`] value living in this module. It is
//! reached exclusively through [`with_kernel`], which hands out a `&mut` for
//! the duration of one closure.
//!
//! Why this is sound on a single core:
//!
//! - Facades only call `with_kernel` with interrupts masked (the critical
//!   section), so no ISR can observe the kernel mid-mutation.
//! - The tick and pend-switch handlers run at the same exception priority
//!   and therefore never preempt each other, and they cannot preempt a
//!   masked facade.
//! - Spin loops that run with interrupts enabled (waiting to be scheduled
//!   again, waiting out idle) never touch the kernel value; they watch the
//!   mirrored atomics below and the arch layer's current-task word.
//!
//! # Debugger visibility
//!
//! Two `#[no_mangle]` words mirror the kernel's health so a halted debugger
//! (or a watchpoint) can triage without symbols for the whole structure:
//!
//! - `KERNEL_STATUS_WORD` tracks the status machine; a kernel parked in
//!   `Error` is visible at a glance.
//! - `KERNEL_FAULT_CODE` latches the composite code (see
//!   `err::Error::code`) of the *first* structural failure, so the kind,
//!   component and reason of whatever broke survive any follow-on damage.
//!   Composite codes never encode as zero; zero means "no failure".
//!
//! Together with the arch layer's current-task word this is the kernel's
//! entire black box; there is deliberately no separate crash-log mechanism
//! to keep in sync with it.

use abi::KernelStatus;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::Kernel;

/// Mirrored kernel status, for debuggers and for spin loops that must not
/// borrow the kernel. See `abi::KernelStatus::code` for the encoding.
#[no_mangle]
static KERNEL_STATUS_WORD: AtomicU32 = AtomicU32::new(0);

/// Composite code of the first recorded failure, or zero. See the module
/// docs.
#[no_mangle]
static KERNEL_FAULT_CODE: AtomicU32 = AtomicU32::new(0);

/// Fault code reported when the kernel panics outright (a failed
/// `uassert!`, an out-of-bounds slice) — at that point there is no
/// composite `Error` value left to encode.
pub const PANIC_FAULT_CODE: u32 = u32::MAX;

pub(crate) fn note_status(status: KernelStatus) {
    KERNEL_STATUS_WORD.store(status.code(), Ordering::Relaxed);
}

/// Reads the mirrored status word.
pub fn status_code() -> u32 {
    KERNEL_STATUS_WORD.load(Ordering::Relaxed)
}

/// Latches a failure code. The first failure wins: whatever broke first is
/// the interesting one, and later errors are usually collateral.
pub(crate) fn note_failure(code: u32) {
    let _ = KERNEL_FAULT_CODE.compare_exchange(
        0,
        code,
        Ordering::Relaxed,
        Ordering::Relaxed,
    );
}

/// Clears the failure latch; part of `deinit` so a re-initialized kernel
/// starts with a clean black box.
pub(crate) fn reset_failure() {
    KERNEL_FAULT_CODE.store(0, Ordering::Relaxed);
}

/// Reads the latched failure code. Zero means no failure has been
/// recorded.
pub fn fault_code() -> u32 {
    KERNEL_FAULT_CODE.load(Ordering::Relaxed)
}

struct KernelCell(UnsafeCell<Kernel>);

// Safety: access goes through `with_kernel` under the discipline described
// in the module docs; the type system alone cannot see that, so we assert
// it here.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(UnsafeCell::new(Kernel::new()));

/// Runs `body` with exclusive access to the kernel.
///
/// # Safety (internal)
///
/// Callers must hold the concurrency discipline from the module docs:
/// either interrupts are masked, or the caller *is* one of the kernel's own
/// handlers. Every call site in this crate satisfies one of the two; the
/// function is kept `pub(crate)` so no outside code can break the rule.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    // Safety: see above — single core, non-reentrant by construction.
    unsafe { body(&mut *KERNEL.0.get()) }
}

/// Last-resort failure path on the target.
///
/// A panicking kernel may be half way through mutating the kernel value, so
/// this touches only the mirrored words: latch the panic code, flip the
/// status word to `Error`, and park with interrupts masked so the wreckage
/// stays exactly where a debugger wants it. The status *field* inside the
/// kernel is not updated — nothing will run again to read it.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    klog!("kernel panic: {}", info);
    let _ = info;
    note_failure(PANIC_FAULT_CODE);
    note_status(KernelStatus::Error);
    crate::arch::disable_interrupts();
    loop {
        crate::arch::wait_for_interrupt();
    }
}
