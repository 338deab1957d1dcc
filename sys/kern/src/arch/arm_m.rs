// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M.
//!
//! # Interrupt layout
//!
//! The kernel installs exactly two handlers, both into a copy of the vector
//! table relocated to RAM:
//!
//! - `SysTick` runs the scheduler tick at 1 kHz.
//! - `PendSV` performs deferred context switches.
//!
//! The split is the usual M-profile latency trick: the tick handler (and
//! any facade running in thread mode) never pays for a register swap
//! itself. Whoever decides a switch is needed pokes the PendSV pending bit;
//! the swap then happens after the deciding context unwinds. Both handlers
//! sit at the lowest exception priority so neither can preempt the other —
//! that non-preemption is one leg of the kernel cell's soundness argument.
//!
//! # The switch itself
//!
//! Exception entry stacks r0-r3, r12, LR, PC and xPSR on the process stack
//! automatically. `PendSV` pushes the remaining r4-r11 below that frame,
//! calls into [`crate::sched::Sched::context_switch`] to trade stack
//! pointers, pops the incoming task's r4-r11 and returns; exception return
//! then unstacks the incoming task's hardware frame. Task stacks are
//! prepared at start with a synthetic frame shaped exactly like that, so
//! the very first entry into a task is indistinguishable from a resume.
//!
//! Floating-point context is deliberately not saved; build for a soft-float
//! target (see the crate manifest).

use core::arch::global_asm;
use core::sync::atomic::{AtomicU32, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use abi::{TaskId, STACK_WORDS};

use crate::startup::with_kernel;
use crate::task::Task;

#[cfg(armv6m)]
compile_error!(
    "ARMv6-M is not supported: the context switch uses STMDB/LDMIA over \
     r4-r11"
);

/// Log things from kernel context. Behind the `klog-itm` feature this goes
/// to ITM stimulus port 0; behind `klog-semihosting` it goes to the debug
/// host (slowly!). With neither feature, it compiles to nothing.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($left:expr, $right:expr) => {
        if !($left == $right) {
            panic!("Assertion failed!");
        }
    };
}

/// Sentinel for "no current task" in `CURRENT_TASK_WORD`.
const NO_TASK: u32 = u32::MAX;

/// Index of the current task, mirrored here so spin loops (and debuggers)
/// can watch it without borrowing the kernel.
#[no_mangle]
static CURRENT_TASK_WORD: AtomicU32 = AtomicU32::new(NO_TASK);

/// SysTick reload value programmed at start, i.e. CPU cycles per kernel
/// tick. Zero means "board code already configured SysTick; leave it
/// alone." Stored here so debuggers can recover the time base.
#[no_mangle]
static TICK_DIVISOR: AtomicU32 = AtomicU32::new(0);

/// Tells the kernel how to program SysTick for a 1 kHz tick: CPU cycles per
/// millisecond. Call from board bring-up before `kernel::start`, or skip it
/// entirely if the board owns SysTick configuration.
pub fn set_tick_divisor(cycles_per_tick: u32) {
    TICK_DIVISOR.store(cycles_per_tick, Ordering::Relaxed);
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN value for "return to thread mode, process stack, no FP
/// context". We assume TrustZone has not been carved up in a way that makes
/// this wrong on the v8-M parts we run on.
const EXC_RETURN_CONST: u32 = 0xFFFF_FFFD;

pub fn disable_interrupts() {
    cortex_m::interrupt::disable();
}

pub fn enable_interrupts() {
    // Safety: unmasking interrupts cannot break memory safety here; the
    // kernel's handlers are installed before anything calls this with work
    // pending.
    unsafe { cortex_m::interrupt::enable() }
}

/// Requests a context switch: sets the PendSV pending bit. The switch
/// happens once no higher-or-equal-priority exception is active and
/// interrupts are unmasked.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Index of the task the pend-switch trap most recently resumed, or `None`
/// before the first switch.
pub fn current_task() -> Option<TaskId> {
    match CURRENT_TASK_WORD.load(Ordering::Relaxed) {
        NO_TASK => None,
        n => Some(TaskId(n as u8)),
    }
}

pub(crate) fn set_current_task(id: TaskId) {
    CURRENT_TASK_WORD.store(id.index() as u32, Ordering::Relaxed);
}

pub(crate) fn clear_current_task() {
    CURRENT_TASK_WORD.store(NO_TASK, Ordering::Relaxed);
}

/// Spins until the pend-switch trap has made `id` current again. Called by
/// facades after they parked the calling task; interrupts must be enabled
/// or nothing will ever change.
pub fn wait_until_current(id: TaskId) {
    while current_task() != Some(id) {
        core::hint::spin_loop();
    }
}

/// Spins while the mirrored status word reads `status`. Used to sit out
/// idle with the CPU sleeping between interrupts.
pub fn wait_while_status(status: u32) {
    while crate::startup::status_code() == status {
        wait_for_interrupt();
    }
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Stuff the hardware places on the stack at exception entry, and that we
/// synthesize at the top of every fresh task stack.
#[derive(Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Words the hardware stacks at exception entry.
const HW_FRAME_WORDS: usize = 8;
/// Words PendSV stacks below that (r4-r11).
const SW_FRAME_WORDS: usize = 8;

/// Builds the synthetic entry frame on `task`'s stack.
///
/// The frame is arranged so that the first time the pend-switch trap
/// restores this task, execution resumes at the task's entry function with
/// LR aimed at the terminate trampoline — a task that returns from its
/// entry function terminates cleanly. Must run after the task table has
/// reached its final storage, since the saved stack pointer is an absolute
/// address.
pub fn initialize_stack(task: &mut Task) {
    let entry = task.entry_point() as u32;
    let stack = task.stack_mut();
    for word in stack.iter_mut() {
        *word = 0;
    }

    let frame = BaseExceptionFrame {
        // Bit 0 marks a Thumb target; plain function pointers carry it
        // already, but be explicit rather than depend on that.
        pc: entry | 1,
        lr: task_exit_trampoline as usize as u32 | 1,
        xpsr: INITIAL_PSR,
        ..BaseExceptionFrame::default()
    };
    let top = STACK_WORDS - HW_FRAME_WORDS;
    <[u32] as IntoBytes>::as_mut_bytes(&mut stack[top..])
        .copy_from_slice(frame.as_bytes());

    // Leave room below the hardware frame for the software-saved r4-r11;
    // the first restore pops them as zeroes.
    let sp_index = STACK_WORDS - HW_FRAME_WORDS - SW_FRAME_WORDS;
    let sp = core::ptr::addr_of!(stack[sp_index]) as u32;
    // AAPCS demands 8-byte stack alignment at the exposed frame.
    uassert_eq!(sp & 0x7, 0);
    task.set_saved_sp(sp);
}

/// Number of vector slots we relocate. Covers the 16 architectural
/// exceptions plus 80 external interrupts, which is plenty for the parts
/// this runs on; bump it (and the alignment) for bigger NVICs.
const VECTOR_WORDS: usize = 96;

#[repr(align(512))]
struct VectorTable([u32; 128]);

static mut VECTOR_TABLE: VectorTable = VectorTable([0; 128]);

/// Relocates the vector table to RAM and points the PendSV and SysTick
/// slots at the kernel's handlers, leaving every other vector as the board
/// had it. Called from `kernel::init`.
pub fn install_vectors() {
    extern "C" {
        fn PendSV();
    }

    disable_interrupts();
    // Safety: we copy out of whatever table the boot code published, write
    // our private RAM table, and republish. Interrupts are masked across
    // the swap, and the barriers order the VTOR write against any following
    // exception entry.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        let src = scb.vtor.read() as *const u32;
        let dst = core::ptr::addr_of_mut!(VECTOR_TABLE.0) as *mut u32;
        for i in 0..VECTOR_WORDS {
            dst.add(i).write_volatile(src.add(i).read_volatile());
        }
        // Exception numbers 14 and 15.
        dst.add(14).write_volatile(PendSV as usize as u32 | 1);
        dst.add(15).write_volatile(systick_entry as usize as u32 | 1);
        scb.vtor.write(dst as u32);
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
    enable_interrupts();
}

/// Final, diverging leg of `kernel::start`.
///
/// Sets exception priorities so the kernel's two handlers cannot preempt
/// each other, optionally programs SysTick, flips thread mode onto the
/// process stack, and lets the already-pended PendSV carry execution into
/// the first task. The bootstrap context never runs again; its stack is
/// abandoned wherever it stood.
pub fn enter_first_task() -> ! {
    klog!("entering first task");
    // Safety: priority and SysTick pokes; all of this only lowers priority
    // or starts the timer, neither of which can violate memory safety.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SVCall, PendSV and SysTick all to the lowest priority. The fault
        // handlers stay at 0 so we can still see kernel bugs.
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        let divisor = TICK_DIVISOR.load(Ordering::Relaxed);
        if divisor != 0 {
            let syst = &*cortex_m::peripheral::SYST::PTR;
            // Program reload value.
            syst.rvr.write(divisor - 1);
            // Clear current value.
            syst.cvr.write(0);
            // Enable counter and interrupt, processor clock.
            syst.csr.modify(|v| v | 0b111);
        }
    }

    // Run thread mode off the process stack from here on: seed PSP from the
    // live MSP and flip CONTROL.SPSEL. Exceptions keep using MSP.
    // Safety: PSP is not in use until the CONTROL write, and the ISB orders
    // the mode change before anything depends on it.
    unsafe {
        cortex_m::register::psp::write(cortex_m::register::msp::read());
        let mut control = cortex_m::register::control::read();
        control.set_spsel(cortex_m::register::control::Spsel::Psp);
        cortex_m::register::control::write(control);
    }
    cortex_m::asm::isb();

    // The first switch was pended by the scheduler; release it.
    enable_interrupts();
    loop {
        wait_for_interrupt();
    }
}

/// Parks the machine: deep-sleep with interrupts off. Reached when every
/// task has terminated.
pub fn shutdown() -> ! {
    klog!("shutdown");
    disable_interrupts();
    // Safety: setting SLEEPDEEP only changes how much of the chip the WFI
    // below turns off.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        const SLEEPDEEP: u32 = 1 << 2;
        scb.scr.modify(|v| v | SLEEPDEEP);
    }
    loop {
        wait_for_interrupt();
    }
}

// The pend-switch trap. On entry the hardware has stacked the outgoing
// task's r0-r3, r12, LR, PC and xPSR onto its process stack. We push the
// rest, let `pendsv_entry` trade stack pointers, and unwind in reverse for
// whichever task is current now.
cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        global_asm! {"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                @ finish saving the outgoing task's context below its
                @ hardware frame.
                mrs r0, psp
                stmdb r0!, {{r4-r11}}

                @ lr holds EXC_RETURN; keep it across the call.
                push {{lr}}
                bl pendsv_entry
                pop {{lr}}

                @ r0 now names the incoming task's saved stack. Restore its
                @ callee-saved registers and hand the rest to the hardware.
                ldmia r0!, {{r4-r11}}
                msr psp, r0
                bx lr
            ",
        }
    } else {
        compile_error!("missing PendSV impl for this ARM profile");
    }
}

/// The Rust half of the pend-switch trap: banks the outgoing stack pointer,
/// asks the scheduler for the incoming one.
///
/// `psp` is the outgoing task's stack pointer with r4-r11 already pushed;
/// the return value is the same thing for the incoming task.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(psp: u32) -> u32 {
    disable_interrupts();
    let next = with_kernel(|k| k.sched.context_switch(psp));
    enable_interrupts();
    // A spurious pend with no current task resumes the interrupted
    // context unchanged.
    next.unwrap_or(psp)
}

/// The tick handler, installed in the SysTick vector slot.
#[no_mangle]
unsafe extern "C" fn systick_entry() {
    with_kernel(|k| k.sched.tick());
}

/// Where tasks land when their entry function returns: AAPCS puts the
/// returned word in r0, which arrives here as `exit_code`.
///
/// Retires the task; if it was the last one the machine shuts down,
/// otherwise execution continues in some other task and this frame is never
/// resumed. The trailing loops exist to catch scheduler errors — a task
/// must not fall off the end of its own trampoline.
#[no_mangle]
unsafe extern "C" fn task_exit_trampoline(exit_code: u32) -> ! {
    use crate::sched::{Switch, Terminate};

    disable_interrupts();
    let outcome = with_kernel(|k| {
        let r = k.sched.terminate_current(exit_code);
        if let Err(e) = r {
            crate::startup::note_failure(crate::err::Error::from(e).code());
            k.sched.note_structural_failure();
        }
        r
    });
    match outcome {
        Ok(Terminate::ShutDown) => shutdown(),
        Ok(Terminate::Switched(Switch::Scheduled)) => {
            enable_interrupts();
            loop {
                wait_for_interrupt();
            }
        }
        Ok(Terminate::Switched(Switch::Idle)) => {
            // Nothing else runnable yet; wait for the tick to wake someone,
            // then hand the CPU over for good.
            enable_interrupts();
            wait_while_status(abi::KernelStatus::Idle.code());
            disable_interrupts();
            with_kernel(|k| {
                if let Err(e) = k.sched.schedule_next() {
                    crate::startup::note_failure(crate::err::Error::from(e).code());
                    k.sched.note_structural_failure();
                }
            });
            enable_interrupts();
            loop {
                wait_for_interrupt();
            }
        }
        Err(_) => loop {
            wait_for_interrupt();
        },
    }
}
