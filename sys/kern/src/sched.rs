// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler core.
//!
//! One [`Sched`] value owns every task-related structure: the task table,
//! the link arena, the per-priority ready lists, the delay/blocked/
//! terminated lists, the status machine and the round-robin cursor. All
//! mutation happens under the kernel's critical section; nothing in here
//! masks interrupts itself.
//!
//! Scheduling is round-robin inside the current priority group, falling to
//! higher-index (less important) groups when the current one drains, plus a
//! starvation-relief pass: at each switch, with its cooldown spent, the
//! occupied group furthest from the CPU is spliced one level up, so steady
//! high-priority load cannot shut lower groups out forever. This is *group
//! promotion* (priority aging), not priority inheritance — the mechanism
//! never looks at who blocks whom.
//!
//! Context switches are requested, not performed: methods that change the
//! current task call `arch::pend_context_switch`, and the pend-switch trap
//! later calls [`Sched::context_switch`] to swap the saved stack pointers.

use abi::{
    BlockCause, EventSet, KernelStatus, Priority, TaskId, TaskState,
    MAX_PRIORITIES, MAX_TASKS,
};

use crate::arch;
use crate::list::{self, LinkTable, ListError, TaskList};
use crate::startup;
use crate::table::{SlotTable, TableError};
use crate::task::{ParkList, Task, TaskConfig};
use crate::trace;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedError {
    /// An operation that needs a running task was called before the kernel
    /// entered one.
    NoCurrentTask,
    /// The round-robin cursor has no successor to switch to.
    NoNextTask,
    /// The status machine refused a transition.
    InvalidTransition,
    /// A task with this id is already registered.
    DuplicateTask,
    /// A table lookup failed.
    Table(TableError),
    /// A list operation failed.
    List(ListError),
}

impl SchedError {
    pub const fn reason(self) -> u32 {
        match self {
            SchedError::NoCurrentTask => 1,
            SchedError::NoNextTask => 2,
            SchedError::InvalidTransition => 3,
            SchedError::DuplicateTask => 4,
            SchedError::Table(e) => 0x10 | e.reason(),
            SchedError::List(e) => 0x20 | e.reason(),
        }
    }
}

impl From<TableError> for SchedError {
    fn from(e: TableError) -> Self {
        SchedError::Table(e)
    }
}

impl From<ListError> for SchedError {
    fn from(e: ListError) -> Self {
        SchedError::List(e)
    }
}

/// What a switch-away accomplished: either a successor was scheduled, or
/// nothing was runnable and the kernel went idle. In the idle case the
/// caller is expected to wait for the tick handler to wake somebody and then
/// schedule the cursor's `next`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Switch {
    Scheduled,
    Idle,
}

/// Outcome of terminating the current task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Terminate {
    /// Every registered task has terminated; shut the system down.
    ShutDown,
    /// Execution continues elsewhere.
    Switched(Switch),
}

/// The pieces a blocking primitive needs in order to park the calling task:
/// who is calling, the ready list it currently occupies, and the link arena.
/// Handing these out as one bundle keeps the primitives free of any direct
/// scheduler dependency.
pub struct ParkContext<'a> {
    pub caller: TaskId,
    pub ready: &'a mut TaskList,
    pub links: &'a mut LinkTable,
}

pub struct Sched {
    tasks: SlotTable<Task, MAX_TASKS>,
    links: LinkTable,
    ready: SlotTable<TaskList, MAX_PRIORITIES>,
    delayed: TaskList,
    blocked: TaskList,
    terminated: TaskList,
    status: KernelStatus,
    in_critical: bool,
    current: Option<TaskId>,
    next: Option<TaskId>,
    previous: Option<TaskId>,
    /// Group index the current task was scheduled from.
    current_priority: usize,
    /// Group index `next` lives in. Equal to `current_priority` except
    /// briefly after a wake-up preemption.
    next_priority: usize,
    tick_count: u64,
    task_count: usize,
    /// Highest-index occupied priority after compaction ("L").
    lowest_priority: usize,
    /// Group the next promotion will lift ("M").
    promotion_target: usize,
    /// Switches to wait before promoting again ("C").
    promotion_cooldown: usize,
}

impl Sched {
    pub const fn new() -> Self {
        Self {
            tasks: SlotTable::new(),
            links: LinkTable::new(),
            ready: SlotTable::new(),
            delayed: TaskList::new(),
            blocked: TaskList::new(),
            terminated: TaskList::new(),
            status: KernelStatus::NotInitialized,
            in_critical: false,
            current: None,
            next: None,
            previous: None,
            current_priority: 0,
            next_priority: 0,
            tick_count: 0,
            task_count: 0,
            lowest_priority: 0,
            promotion_target: 0,
            promotion_cooldown: 0,
        }
    }

    /// Creates every priority group. Groups above the dense prefix are
    /// deleted again by `compact_priorities` at start.
    pub fn initialize(&mut self) {
        for p in 0..MAX_PRIORITIES {
            // Capacity is MAX_PRIORITIES, so this cannot fail.
            let _ = self.ready.insert(p, TaskList::new());
        }
    }

    /// Tears everything down in place, returning to the pre-`init` state.
    /// Field-by-field so no whole-kernel temporary lands on the stack.
    pub fn reset(&mut self) {
        for i in 0..MAX_TASKS {
            let _ = self.tasks.remove(i);
        }
        for p in 0..MAX_PRIORITIES {
            let _ = self.ready.remove(p);
        }
        self.links = LinkTable::new();
        self.delayed = TaskList::new();
        self.blocked = TaskList::new();
        self.terminated = TaskList::new();
        self.status = KernelStatus::NotInitialized;
        startup::note_status(self.status);
        self.in_critical = false;
        self.current = None;
        self.next = None;
        self.previous = None;
        self.current_priority = 0;
        self.next_priority = 0;
        self.tick_count = 0;
        self.task_count = 0;
        self.lowest_priority = 0;
        self.promotion_target = 0;
        self.promotion_cooldown = 0;
    }

    pub fn status(&self) -> KernelStatus {
        self.status
    }

    /// Drives the status machine. Anything may enter `Error`; the other
    /// transitions are restricted to init → Starting → Running ↔ Idle. A
    /// refused transition itself lands in `Error`.
    pub fn set_status(&mut self, new: KernelStatus) -> Result<(), SchedError> {
        let allowed = match new {
            KernelStatus::Starting => self.status == KernelStatus::NotInitialized,
            KernelStatus::Running => matches!(
                self.status,
                KernelStatus::Starting | KernelStatus::Idle
            ),
            KernelStatus::Idle => self.status == KernelStatus::Running,
            KernelStatus::Error => true,
            KernelStatus::NotInitialized => false,
        };
        if !allowed {
            self.status = KernelStatus::Error;
            startup::note_status(self.status);
            return Err(SchedError::InvalidTransition);
        }
        self.status = new;
        startup::note_status(self.status);
        Ok(())
    }

    /// Records a broken invariant: parks the status machine in `Error`.
    pub fn note_structural_failure(&mut self) {
        self.status = KernelStatus::Error;
        startup::note_status(self.status);
    }

    pub fn in_critical(&self) -> bool {
        self.in_critical
    }

    pub fn set_critical(&mut self, active: bool) {
        self.in_critical = active;
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn next_task(&self) -> Option<TaskId> {
        self.next
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn task(&self, id: TaskId) -> Result<&Task, SchedError> {
        Ok(self.tasks.get(id.index())?)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, SchedError> {
        Ok(self.tasks.get_mut(id.index())?)
    }

    /// Read access to a priority group, mostly for tests and assertions.
    pub fn group(&self, priority: usize) -> Option<&TaskList> {
        self.ready.get(priority).ok()
    }

    pub fn delayed_list(&self) -> &TaskList {
        &self.delayed
    }

    pub fn blocked_list(&self) -> &TaskList {
        &self.blocked
    }

    pub fn terminated_list(&self) -> &TaskList {
        &self.terminated
    }

    pub(crate) fn links(&self) -> &LinkTable {
        &self.links
    }

    /// Registers a task. Only legal before `start`; ids are dense and must
    /// be unique.
    pub fn add_task(&mut self, config: &TaskConfig<'_>) -> Result<(), SchedError> {
        let index = config.id.index();
        if index >= MAX_TASKS {
            return Err(SchedError::Table(TableError::Overflow));
        }
        if self.tasks.contains(index) {
            return Err(SchedError::DuplicateTask);
        }
        let priority = config.priority.index();
        // Reject out-of-range priorities before the task lands anywhere.
        self.ready.get(priority)?;

        self.tasks.insert(index, Task::create(config))?;
        let Sched { ready, links, .. } = self;
        ready.get_mut(priority)?.push_back(links, config.id);

        // Track the occupied floor of the priority space for the promotion
        // pass.
        if priority > self.lowest_priority {
            self.lowest_priority = priority;
            self.promotion_target = priority;
        }
        self.task_count += 1;
        Ok(())
    }

    /// Start-time compaction: collapse the occupied priority groups into a
    /// dense prefix rooted at 0, rewriting each moved task's priority so
    /// group index and task priority agree again, then delete the now-empty
    /// groups above the prefix.
    pub fn compact_priorities(&mut self) -> Result<(), SchedError> {
        let mut lowest = 0;
        for p in 0..MAX_PRIORITIES {
            if self.ready.get(p).map(|g| !g.is_empty()).unwrap_or(false) {
                lowest = p;
                continue;
            }
            // Group p is empty; pull up the nearest occupied group below it.
            let mut donor = None;
            for q in p + 1..MAX_PRIORITIES {
                if self.ready.get(q).map(|g| !g.is_empty()).unwrap_or(false) {
                    donor = Some(q);
                    break;
                }
            }
            let Some(q) = donor else {
                break;
            };

            let mut cursor = self.ready.get(q)?.front();
            while let Some(t) = cursor {
                cursor = self.links.next(t);
                self.tasks.get_mut(t.index())?.set_priority(Priority(p as u8));
            }
            let (dst, src) = self.ready.get_pair_mut(p, q)?;
            let links = &mut self.links;
            list::splice_back(dst, src, links);
            lowest = p;
        }
        if self.task_count == 0 {
            lowest = 0;
        }
        self.lowest_priority = lowest;
        self.promotion_target = lowest;
        for p in lowest + 1..MAX_PRIORITIES {
            let _ = self.ready.remove(p);
        }
        Ok(())
    }

    /// Builds every task's synthetic entry frame. Must run during `start`,
    /// once the task table has reached its final storage — the saved stack
    /// pointers are absolute addresses into it.
    pub fn prepare_stacks(&mut self) {
        for i in 0..MAX_TASKS {
            if let Ok(task) = self.tasks.get_mut(i) {
                arch::initialize_stack(task);
            }
        }
    }

    /// Marks every registered task runnable. Part of `start`, after
    /// compaction.
    pub fn make_tasks_ready(&mut self) {
        for i in 0..MAX_TASKS {
            if let Ok(task) = self.tasks.get_mut(i) {
                task.set_state(TaskState::Ready);
            }
        }
    }

    /// First occupied group at `start` or above, with its front task.
    pub fn scan_ready_from(&self, start: usize) -> Option<(usize, TaskId)> {
        for p in start..MAX_PRIORITIES {
            if let Ok(group) = self.ready.get(p) {
                if let Some(front) = group.front() {
                    return Some((p, front));
                }
            }
        }
        None
    }

    /// Hands out the caller/ready-list/links bundle a blocking primitive
    /// needs to park the current task.
    pub(crate) fn park_context(&mut self) -> Result<ParkContext<'_>, SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        let Sched {
            ready,
            links,
            current_priority,
            ..
        } = self;
        let ready = ready.get_mut(*current_priority)?;
        Ok(ParkContext {
            caller,
            ready,
            links,
        })
    }

    /// Moves the current task from its ready group into `dst` (a primitive's
    /// wait list). The task is parked but not yet marked blocked.
    pub(crate) fn park_current(&mut self, dst: &mut TaskList) -> Result<TaskId, SchedError> {
        let ctx = self.park_context()?;
        let caller = ctx.caller;
        list::transfer(dst, ctx.ready, ctx.links, caller)?;
        Ok(caller)
    }

    /// Makes `id` (in group `priority`) the current task and requests the
    /// context switch. This is the single funnel every switch goes through,
    /// so it is also where the promotion pass runs.
    pub fn schedule(&mut self, priority: usize, id: TaskId) -> Result<(), SchedError> {
        {
            let task = self.tasks.get_mut(id.index())?;
            task.set_state(TaskState::Ready);
            task.reset_quantum();
        }

        self.previous = self.current;
        if let Some(prev) = self.previous {
            if prev != id {
                let task = self.tasks.get_mut(prev.index())?;
                if !matches!(
                    task.state(),
                    TaskState::Blocked | TaskState::Terminated
                ) {
                    task.set_state(TaskState::Ready);
                }
            }
        }

        self.apply_promotion(priority)?;

        self.current = Some(id);
        self.current_priority = priority;
        // Round-robin successor: link order within the group, wrapping to
        // the group front.
        let group = self.ready.get(priority)?;
        self.next = self.links.next(id).or_else(|| group.front());
        self.next_priority = priority;

        arch::pend_context_switch();
        Ok(())
    }

    /// Schedules the cursor's `next` task.
    pub fn schedule_next(&mut self) -> Result<(), SchedError> {
        let id = self.next.ok_or(SchedError::NoNextTask)?;
        self.schedule(self.next_priority, id)
    }

    /// The group-promotion (priority aging) pass, run once per switch.
    ///
    /// With the cooldown spent and the promotion target still below the
    /// incoming group, the target group is spliced one level up wholesale.
    /// When the target reaches the incoming group the walk restarts at the
    /// occupied floor and the cooldown is charged with the number of tasks
    /// just lifted, so the promoted tasks get slices before the next lift.
    /// Task priority fields are left alone: a promoted task that blocks
    /// re-enters its home group.
    fn apply_promotion(&mut self, incoming_priority: usize) -> Result<(), SchedError> {
        if self.promotion_cooldown > 0 {
            self.promotion_cooldown -= 1;
        }
        // The target may point at the group we are about to run; promotion
        // must only ever lift groups from further away.
        if self.promotion_target <= incoming_priority {
            self.promotion_target = self.lowest_priority;
        }
        if self.promotion_cooldown == 0 && self.promotion_target > incoming_priority {
            let src = self.promotion_target;
            let dst = src - 1;
            match self.ready.get_pair_mut(dst, src) {
                Ok((dst_group, src_group)) => {
                    let moved = src_group.len();
                    list::splice_back(dst_group, src_group, &mut self.links);
                    self.promotion_target -= 1;
                    if self.promotion_target == incoming_priority {
                        self.promotion_target = self.lowest_priority;
                        self.promotion_cooldown = moved;
                    }
                }
                // A deleted group here means the bookkeeping drifted from
                // the compacted layout; skip rather than wedge scheduling.
                Err(_) => self.promotion_target = self.lowest_priority,
            }
        }
        Ok(())
    }

    /// Picks a successor after the current task has left its ready group
    /// (blocked, delayed or terminated) and schedules it, or goes idle when
    /// nothing is runnable anywhere.
    fn switch_away(&mut self) -> Result<Switch, SchedError> {
        let leaving = self.current;
        // Honor the precomputed successor if it is still a live member of
        // its group; the caller may have just unlinked it.
        let candidate = self
            .next
            .filter(|&n| Some(n) != leaving)
            .filter(|&n| {
                self.ready
                    .get(self.next_priority)
                    .map(|g| g.contains(&self.links, n))
                    .unwrap_or(false)
            })
            .map(|n| (self.next_priority, n));

        let candidate = candidate
            .or_else(|| {
                self.ready
                    .get(self.current_priority)
                    .ok()
                    .and_then(|g| g.front())
                    .map(|f| (self.current_priority, f))
            })
            .or_else(|| self.scan_ready_from(self.current_priority + 1));

        match candidate {
            Some((p, id)) => {
                self.schedule(p, id)?;
                Ok(Switch::Scheduled)
            }
            None => {
                self.enter_idle()?;
                Ok(Switch::Idle)
            }
        }
    }

    /// Marks the current task blocked (with a cause for the trace stream)
    /// and switches away from it. The caller has already transferred the
    /// task out of its ready group.
    pub fn swap_after_block(&mut self, cause: BlockCause) -> Result<Switch, SchedError> {
        let blocked = self.current.ok_or(SchedError::NoCurrentTask)?;
        {
            let task = self.tasks.get_mut(blocked.index())?;
            task.set_cause(cause);
            task.set_state(TaskState::Blocked);
        }
        self.switch_away()
    }

    /// Returns `id` from `source` (a primitive's wait list) to its priority
    /// group and refreshes the cursor.
    pub fn reinsert_external(
        &mut self,
        source: &mut TaskList,
        id: TaskId,
    ) -> Result<(), SchedError> {
        let priority = self.tasks.get(id.index())?.priority().index();
        {
            let Sched { ready, links, .. } = self;
            list::transfer(ready.get_mut(priority)?, source, links, id)?;
        }
        self.finish_reinsert(id, priority)
    }

    /// Returns `id` from the delay list or the blocked-on-events list to its
    /// priority group.
    pub fn reinsert_parked(&mut self, which: ParkList, id: TaskId) -> Result<(), SchedError> {
        let priority = self.tasks.get(id.index())?.priority().index();
        {
            let Sched {
                ready,
                links,
                delayed,
                blocked,
                ..
            } = self;
            let source = match which {
                ParkList::Delayed => delayed,
                ParkList::Events => blocked,
            };
            list::transfer(ready.get_mut(priority)?, source, links, id)?;
        }
        self.finish_reinsert(id, priority)
    }

    fn finish_reinsert(&mut self, id: TaskId, priority: usize) -> Result<(), SchedError> {
        {
            let task = self.tasks.get_mut(id.index())?;
            task.set_parked_in(None);
            task.set_state(TaskState::Ready);
        }
        // A more important wake-up (or any wake-up out of idle) takes over
        // the cursor; otherwise just refresh the successor, since the woken
        // task may have landed in the current group.
        if priority < self.current_priority || self.status == KernelStatus::Idle {
            self.next = Some(id);
            self.next_priority = priority;
            self.current_priority = priority;
        } else if let Some(cur) = self.current {
            self.next = self
                .links
                .next(cur)
                .or_else(|| self.ready.get(self.current_priority).ok().and_then(|g| g.front()));
            self.next_priority = self.current_priority;
        }
        Ok(())
    }

    /// Inserts the current task into the delay list, `ticks` from now, in
    /// cumulative-delta order, and removes it from its ready group. The
    /// delta stored on each member is relative to its predecessor; only the
    /// front of the list counts down in the tick handler.
    pub fn park_current_delayed(&mut self, ticks: u32) -> Result<(), SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;

        let mut delta_sum: u32 = 0;
        let mut insert_after: Option<TaskId> = None;
        let mut cursor = self.delayed.front();
        while let Some(t) = cursor {
            let dt = self.tasks.get(t.index())?.delta();
            if delta_sum + dt > ticks {
                // The newcomer goes in front of `t`; `t` keeps the
                // remainder so its absolute wake instant is unchanged.
                let remainder = ticks - delta_sum;
                self.tasks.get_mut(t.index())?.set_delta(dt - remainder);
                insert_after = self.links.prev(t);
                break;
            }
            delta_sum += dt;
            insert_after = Some(t);
            cursor = self.links.next(t);
        }
        self.tasks.get_mut(caller.index())?.set_delta(ticks - delta_sum);

        let Sched {
            ready,
            links,
            delayed,
            current_priority,
            ..
        } = self;
        let group = ready.get_mut(*current_priority)?;
        list::transfer_after(delayed, insert_after, group, links, caller)?;
        Ok(())
    }

    /// Event wait without timeout: parks the current task on the blocked
    /// list and records the park location so `event_send` can find it.
    pub fn park_current_on_events(&mut self) -> Result<(), SchedError> {
        let caller = {
            let Sched {
                ready,
                links,
                blocked,
                current,
                current_priority,
                ..
            } = self;
            let caller = current.ok_or(SchedError::NoCurrentTask)?;
            list::transfer(blocked, ready.get_mut(*current_priority)?, links, caller)?;
            caller
        };
        self.tasks
            .get_mut(caller.index())?
            .set_parked_in(Some(ParkList::Events));
        Ok(())
    }

    /// Event wait with timeout: delay-list parking plus the park marker.
    pub fn event_park_current_timeout(&mut self, ticks: u32) -> Result<(), SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        self.park_current_delayed(ticks)?;
        self.tasks
            .get_mut(caller.index())?
            .set_parked_in(Some(ParkList::Delayed));
        Ok(())
    }

    /// Delivers event bits to `target`: OR them in, run the filter, and if
    /// the wanted set is now covered, wake the target from wherever it
    /// parked. A target woken out of the delay list donates its remaining
    /// delta to its successor so every other wake instant is preserved.
    pub fn event_send(&mut self, target: TaskId, events: EventSet) -> Result<(), SchedError> {
        let satisfied = {
            let reg = self.tasks.get_mut(target.index())?.events_mut();
            reg.received.insert(events);
            let wanted = reg.wanted;
            if let Some(filter) = reg.filter {
                filter(&mut reg.received, wanted);
            }
            reg.received.satisfies(wanted) && !wanted.is_empty()
        };
        if !satisfied {
            return Ok(());
        }
        match self.tasks.get(target.index())?.parked_in() {
            Some(ParkList::Events) => self.reinsert_parked(ParkList::Events, target)?,
            Some(ParkList::Delayed) => {
                if let Some(succ) = self.links.next(target) {
                    let donated = self.tasks.get(target.index())?.delta();
                    let succ_delta = self.tasks.get(succ.index())?.delta();
                    self.tasks
                        .get_mut(succ.index())?
                        .set_delta(succ_delta + donated);
                }
                self.tasks.get_mut(target.index())?.set_delta(0);
                self.reinsert_parked(ParkList::Delayed, target)?;
            }
            None => {}
        }
        Ok(())
    }

    /// Checks the current task's event register. When the wanted set is
    /// covered, returns the register contents and clears the wanted bits;
    /// otherwise leaves everything in place.
    pub fn event_poll_current(&mut self) -> Result<Option<EventSet>, SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        let reg = self.tasks.get_mut(caller.index())?.events_mut();
        if reg.received.satisfies(reg.wanted) {
            let out = reg.received;
            let wanted = reg.wanted;
            reg.received.clear(wanted);
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    /// Clears the current task's wanted bits from its received set. Run on
    /// the timeout failure path, mirroring the success path's consumption.
    pub fn event_clear_wanted_current(&mut self) -> Result<(), SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        let reg = self.tasks.get_mut(caller.index())?.events_mut();
        let wanted = reg.wanted;
        reg.received.clear(wanted);
        Ok(())
    }

    /// Event timeout of the current task, read at park time.
    pub fn event_timeout_current(&self) -> Result<u32, SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        Ok(self.tasks.get(caller.index())?.events().timeout)
    }

    /// Retires the current task: records its exit code, moves it to the
    /// terminated list, and either reports that the whole system is done or
    /// switches to a survivor.
    pub fn terminate_current(&mut self, exit_code: u32) -> Result<Terminate, SchedError> {
        let caller = self.current.ok_or(SchedError::NoCurrentTask)?;
        {
            let Sched {
                ready,
                links,
                terminated,
                current_priority,
                ..
            } = self;
            list::transfer(terminated, ready.get_mut(*current_priority)?, links, caller)?;
        }
        {
            let task = self.tasks.get_mut(caller.index())?;
            task.set_exit_code(exit_code);
            task.set_state(TaskState::Terminated);
        }
        if self.terminated.len() == self.task_count {
            return Ok(Terminate::ShutDown);
        }
        Ok(Terminate::Switched(self.switch_away()?))
    }

    /// Nothing runnable anywhere: park the status machine in `Idle` with
    /// the critical section released, so the tick handler can wake us.
    fn enter_idle(&mut self) -> Result<(), SchedError> {
        self.set_status(KernelStatus::Idle)?;
        trace::event_system_idle();
        if self.in_critical {
            self.in_critical = false;
        }
        Ok(())
    }

    fn exit_idle(&mut self) -> Result<(), SchedError> {
        self.set_status(KernelStatus::Running)
    }

    /// The 1 kHz tick. Advances kernel time; during a critical section that
    /// is *all* it does. Otherwise it pays out at most one delay-list
    /// wake-up, then either switches on quantum exhaustion, leaves idle if
    /// the wake-up gave us a runnable task, or burns one quantum tick.
    pub fn tick(&mut self) {
        self.tick_count = self.tick_count.wrapping_add(1);
        if self.current.is_none()
            || matches!(
                self.status,
                KernelStatus::NotInitialized | KernelStatus::Error
            )
        {
            return;
        }
        trace::event_tick_isr_enter();
        if self.in_critical {
            trace::event_tick_isr_exit();
            return;
        }

        let mut woke = false;
        if let Some(front) = self.delayed.front() {
            let delta = self
                .tasks
                .get(front.index())
                .map(|t| t.delta())
                .unwrap_or(0);
            if delta == 0 {
                woke = self.reinsert_parked(ParkList::Delayed, front).is_ok();
            } else if let Ok(task) = self.tasks.get_mut(front.index()) {
                task.set_delta(delta - 1);
            }
        }

        let quantum_spent = self
            .current
            .and_then(|c| self.tasks.get(c.index()).ok())
            .map(|t| t.quantum_remaining() == 0)
            .unwrap_or(false);

        if quantum_spent && !self.in_critical && self.status != KernelStatus::Idle {
            if self.schedule_next().is_err() {
                self.note_structural_failure();
            }
        } else if self.status == KernelStatus::Idle && woke {
            let _ = self.exit_idle();
        } else if !quantum_spent {
            if let Some(cur) = self.current {
                if let Ok(task) = self.tasks.get_mut(cur.index()) {
                    task.consume_quantum();
                }
            }
        }
        trace::event_tick_isr_exit();
    }

    /// The downstairs half of the context switch, called from the
    /// pend-switch trap once the outgoing task's registers sit on its
    /// process stack. Banks the outgoing stack pointer, marks the incoming
    /// task running with a fresh quantum, releases the critical section, and
    /// returns the stack pointer to resume from. `None` means no switch is
    /// possible (no current task) and the trap should return unchanged.
    pub fn context_switch(&mut self, inbound_psp: u32) -> Option<u32> {
        if let Some(prev) = self.previous {
            if let Ok(task) = self.tasks.get_mut(prev.index()) {
                task.set_saved_sp(inbound_psp);
            }
        }
        let cur = self.current?;
        let task = self.tasks.get_mut(cur.index()).ok()?;
        task.reset_quantum();
        task.set_state(TaskState::Running);
        let sp = task.saved_sp();
        // The critical section does not survive a switch; the resumed task
        // runs outside it.
        if self.in_critical {
            self.in_critical = false;
        }
        arch::set_current_task(cur);
        Some(sp)
    }
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{EventFilter, MAX_MESSAGE_SIZE};

    fn noop() -> u32 {
        0
    }

    fn config(id: u8, priority: u8, quantum: u32) -> TaskConfig<'static> {
        TaskConfig {
            entry: noop,
            id: TaskId(id),
            name: "task",
            priority: Priority(priority),
            quantum,
            wanted_events: EventSet::EMPTY,
            event_filter: None,
            event_timeout: 0,
        }
    }

    fn sched_with(specs: &[(u8, u8, u32)]) -> Sched {
        let mut s = Sched::new();
        s.initialize();
        for &(id, priority, quantum) in specs {
            s.add_task(&config(id, priority, quantum)).unwrap();
        }
        s
    }

    /// Compacts, readies and enters the first task, emulating the trap with
    /// a direct `context_switch` call.
    fn start(s: &mut Sched) {
        s.set_status(KernelStatus::Starting).unwrap();
        s.compact_priorities().unwrap();
        s.make_tasks_ready();
        s.set_status(KernelStatus::Running).unwrap();
        let (p, id) = s.scan_ready_from(0).unwrap();
        s.schedule(p, id).unwrap();
        settle(s);
    }

    /// Emulates the pend-switch trap firing.
    fn settle(s: &mut Sched) {
        let _ = crate::arch::take_pending_switch();
        s.context_switch(0);
    }

    fn state(s: &Sched, id: u8) -> TaskState {
        s.task(TaskId(id)).unwrap().state()
    }

    /// P1: every registered task appears in exactly one list.
    fn assert_single_membership(s: &Sched) {
        for i in 0..MAX_TASKS {
            let Ok(task) = s.tasks.get(i) else { continue };
            let id = task.id();
            let mut count = 0;
            for p in 0..MAX_PRIORITIES {
                if let Some(g) = s.group(p) {
                    if g.contains(&s.links, id) {
                        count += 1;
                    }
                }
            }
            for l in [&s.delayed, &s.blocked, &s.terminated] {
                if l.contains(&s.links, id) {
                    count += 1;
                }
            }
            assert_eq!(count, 1, "task {i} is in {count} lists");
        }
    }

    #[test]
    fn add_task_rejects_duplicates_and_overflow() {
        let mut s = sched_with(&[(0, 0, 1)]);
        assert_eq!(
            s.add_task(&config(0, 1, 1)),
            Err(SchedError::DuplicateTask)
        );
        assert_eq!(
            s.add_task(&config(255, 0, 1)),
            Err(SchedError::Table(TableError::Overflow))
        );
        assert_eq!(s.task_count(), 1);
    }

    #[test]
    fn compaction_produces_a_dense_prefix() {
        let mut s = sched_with(&[(0, 0, 1), (1, 3, 1), (2, 10, 1), (3, 10, 1)]);
        s.compact_priorities().unwrap();

        // Groups 0..=2 occupied, everything above deleted.
        assert_eq!(s.group(0).unwrap().len(), 1);
        assert_eq!(s.group(1).unwrap().len(), 1);
        assert_eq!(s.group(2).unwrap().len(), 2);
        assert!(s.group(3).is_none());
        assert_eq!(s.lowest_priority, 2);

        // Task priorities follow their new group (I5).
        assert_eq!(s.task(TaskId(1)).unwrap().priority(), Priority(1));
        assert_eq!(s.task(TaskId(2)).unwrap().priority(), Priority(2));
        assert_eq!(s.task(TaskId(3)).unwrap().priority(), Priority(2));
        assert_single_membership(&s);
    }

    #[test]
    fn compaction_of_dense_layout_changes_nothing() {
        let mut s = sched_with(&[(0, 0, 1), (1, 1, 1)]);
        s.compact_priorities().unwrap();
        assert_eq!(s.task(TaskId(0)).unwrap().priority(), Priority(0));
        assert_eq!(s.task(TaskId(1)).unwrap().priority(), Priority(1));
        assert_eq!(s.lowest_priority, 1);
    }

    #[test]
    fn start_enters_the_most_important_task() {
        let mut s = sched_with(&[(0, 2, 5), (1, 7, 5)]);
        start(&mut s);
        assert_eq!(s.current(), Some(TaskId(0)));
        assert_eq!(state(&s, 0), TaskState::Running);
        assert_eq!(s.status(), KernelStatus::Running);
    }

    #[test]
    fn quantum_expiry_rotates_within_the_group() {
        let mut s = sched_with(&[(0, 0, 2), (1, 0, 2)]);
        start(&mut s);
        assert_eq!(s.current(), Some(TaskId(0)));

        // Two ticks drain task 0's quantum; the third switches.
        s.tick();
        s.tick();
        s.tick();
        assert!(crate::arch::take_pending_switch());
        s.context_switch(0);
        assert_eq!(s.current(), Some(TaskId(1)));
        assert_eq!(state(&s, 1), TaskState::Running);
        assert_eq!(state(&s, 0), TaskState::Ready);

        // And back again: round-robin, not priority preference.
        s.tick();
        s.tick();
        s.tick();
        settle(&mut s);
        assert_eq!(s.current(), Some(TaskId(0)));
    }

    #[test]
    fn critical_section_defers_the_tick() {
        let mut s = sched_with(&[(0, 0, 1), (1, 0, 1)]);
        start(&mut s);
        s.set_critical(true);
        let before = s.current();
        for _ in 0..5 {
            s.tick();
        }
        // Time advances but no switch happens while the flag is up.
        assert_eq!(s.tick_count(), 5);
        assert_eq!(s.current(), before);
        assert!(!crate::arch::take_pending_switch());
        s.set_critical(false);
    }

    #[test]
    fn delay_parks_in_cumulative_delta_order() {
        let mut s = sched_with(&[(0, 0, 10), (1, 0, 10), (2, 0, 10)]);
        start(&mut s);

        // Current task (0) delays 5 ticks.
        s.park_current_delayed(5).unwrap();
        let sw = s.swap_after_block(BlockCause::Delay).unwrap();
        assert_eq!(sw, Switch::Scheduled);
        settle(&mut s);

        // Current task (1) delays 3 ticks: lands in front of task 0, which
        // keeps a delta of 2.
        s.park_current_delayed(3).unwrap();
        let _ = s.swap_after_block(BlockCause::Delay).unwrap();
        settle(&mut s);

        assert_eq!(s.delayed.front(), Some(TaskId(1)));
        assert_eq!(s.task(TaskId(1)).unwrap().delta(), 3);
        assert_eq!(s.task(TaskId(0)).unwrap().delta(), 2);
        assert_single_membership(&s);
    }

    #[test]
    fn delayed_task_wakes_after_its_delta_drains() {
        let mut s = sched_with(&[(0, 0, 100), (1, 0, 100)]);
        start(&mut s);

        s.park_current_delayed(3).unwrap();
        let _ = s.swap_after_block(BlockCause::Delay).unwrap();
        settle(&mut s);
        assert_eq!(state(&s, 0), TaskState::Blocked);

        // Deltas 3,2,1,0 then the wake tick.
        for _ in 0..3 {
            s.tick();
            assert_eq!(state(&s, 0), TaskState::Blocked);
        }
        s.tick();
        assert_eq!(state(&s, 0), TaskState::Ready);
        assert!(s.group(0).unwrap().contains(&s.links, TaskId(0)));
        assert_single_membership(&s);
    }

    #[test]
    fn sole_task_delay_idles_and_wakes() {
        let mut s = sched_with(&[(0, 0, 4)]);
        start(&mut s);

        s.park_current_delayed(2).unwrap();
        let sw = s.swap_after_block(BlockCause::Delay).unwrap();
        assert_eq!(sw, Switch::Idle);
        assert_eq!(s.status(), KernelStatus::Idle);

        // The delay drains under idle; the wake tick re-readies the task
        // and leaves idle.
        s.tick();
        s.tick();
        s.tick();
        assert_eq!(s.status(), KernelStatus::Running);
        assert_eq!(state(&s, 0), TaskState::Ready);
        assert_eq!(s.next_task(), Some(TaskId(0)));

        s.schedule_next().unwrap();
        settle(&mut s);
        assert_eq!(state(&s, 0), TaskState::Running);
    }

    #[test]
    fn higher_priority_wakeup_takes_over_the_cursor() {
        let mut s = sched_with(&[(0, 0, 4), (1, 1, 4)]);
        // Park the promotion pass so the groups stay separate for this
        // test.
        s.promotion_cooldown = 1_000;
        start(&mut s);

        // Task 0 (prio 0) delays; task 1 (prio 1) runs.
        s.park_current_delayed(2).unwrap();
        let _ = s.swap_after_block(BlockCause::Delay).unwrap();
        settle(&mut s);
        assert_eq!(s.current(), Some(TaskId(1)));
        assert_eq!(s.current_priority, 1);

        // When 0 wakes it must take over the cursor, not wait its turn.
        s.tick();
        s.tick();
        s.tick();
        assert_eq!(s.next_task(), Some(TaskId(0)));
        assert_eq!(s.next_priority, 0);
        assert_eq!(s.current_priority, 0);
    }

    #[test]
    fn promotion_eventually_lifts_the_lowest_group() {
        // Three groups after compaction: 0, 1, 2.
        let mut s = sched_with(&[(0, 0, 4), (1, 3, 4), (2, 10, 4)]);
        start(&mut s);

        // The switch into the first task already walked the target one
        // level: group 2 was spliced into group 1.
        assert_eq!(s.promotion_target, 1);
        assert_eq!(s.group(1).unwrap().len(), 2);
        assert!(s.group(2).unwrap().is_empty());

        // The next switch at priority 0 lifts the merged group the rest of
        // the way.
        s.schedule(0, TaskId(0)).unwrap();
        settle(&mut s);
        assert_eq!(s.group(0).unwrap().len(), 3);
        assert!(s.group(1).unwrap().is_empty());
        // Target reset to the floor, cooldown charged with the move size.
        assert_eq!(s.promotion_target, 2);
        assert_eq!(s.promotion_cooldown, 2);
        assert_single_membership(&s);

        // The formerly starved tasks now get CPU time via plain
        // round-robin.
        s.schedule_next().unwrap();
        settle(&mut s);
        assert_ne!(s.current(), Some(TaskId(0)));
    }

    #[test]
    fn promoted_task_returns_to_home_group_when_reinserted() {
        let mut s = sched_with(&[(0, 0, 4), (1, 1, 4)]);
        start(&mut s);
        // Promote group 1 into group 0.
        s.schedule(0, TaskId(0)).unwrap();
        settle(&mut s);
        assert_eq!(s.group(0).unwrap().len(), 2);

        // Rotate to task 1 and block it on the delay list.
        s.schedule(0, TaskId(1)).unwrap();
        settle(&mut s);
        s.park_current_delayed(1).unwrap();
        let _ = s.swap_after_block(BlockCause::Delay).unwrap();
        settle(&mut s);

        // It wakes into its *home* group (priority field), not group 0.
        s.tick();
        s.tick();
        assert!(s.group(1).unwrap().contains(&s.links, TaskId(1)));
    }

    #[test]
    fn event_send_wakes_blocked_receiver() {
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4)]);
        s.task_mut(TaskId(0)).unwrap().events_mut().wanted = EventSet(0x8);
        start(&mut s);

        // Task 0 waits for 0x8 with no timeout.
        assert_eq!(s.event_poll_current().unwrap(), None);
        s.park_current_on_events().unwrap();
        let _ = s.swap_after_block(BlockCause::Events).unwrap();
        settle(&mut s);
        assert_eq!(state(&s, 0), TaskState::Blocked);
        assert_eq!(s.blocked.len(), 1);

        // Partial events don't wake it (P11).
        s.event_send(TaskId(0), EventSet(0x1)).unwrap();
        assert_eq!(state(&s, 0), TaskState::Blocked);

        s.event_send(TaskId(0), EventSet(0x8)).unwrap();
        assert_eq!(state(&s, 0), TaskState::Ready);
        assert_eq!(s.blocked.len(), 0);

        // Once it runs again, the poll returns and clears the wanted bits.
        s.schedule(0, TaskId(0)).unwrap();
        settle(&mut s);
        let got = s.event_poll_current().unwrap().unwrap();
        assert!(got.satisfies(EventSet(0x8)));
        assert_eq!(
            s.task(TaskId(0)).unwrap().events().received,
            EventSet(0x1)
        );
    }

    #[test]
    fn event_filter_can_suppress_the_wakeup() {
        // P12: a filter that strips 0x8 keeps the waiter blocked.
        let strip: EventFilter = |received, _wanted| received.clear(EventSet(0x8));
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4)]);
        {
            let reg = s.task_mut(TaskId(0)).unwrap().events_mut();
            reg.wanted = EventSet(0x8);
            reg.filter = Some(strip);
        }
        start(&mut s);
        s.park_current_on_events().unwrap();
        let _ = s.swap_after_block(BlockCause::Events).unwrap();
        settle(&mut s);

        s.event_send(TaskId(0), EventSet(0x8)).unwrap();
        assert_eq!(state(&s, 0), TaskState::Blocked);
        assert_eq!(
            s.task(TaskId(0)).unwrap().events().received,
            EventSet::EMPTY
        );
    }

    #[test]
    fn event_wake_from_delay_list_preserves_other_wake_instants() {
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4), (2, 0, 4)]);
        s.task_mut(TaskId(0)).unwrap().events_mut().wanted = EventSet(0x4);
        start(&mut s);

        // Task 0 waits with a 10-tick timeout; task 1 delays 15 so it sits
        // behind task 0 with delta 5.
        s.event_park_current_timeout(10).unwrap();
        let _ = s.swap_after_block(BlockCause::Events).unwrap();
        settle(&mut s);
        s.park_current_delayed(15).unwrap();
        let _ = s.swap_after_block(BlockCause::Delay).unwrap();
        settle(&mut s);
        assert_eq!(s.task(TaskId(1)).unwrap().delta(), 5);

        // The event arrives early; task 0 leaves the delay list and task 1
        // inherits the unspent delta, keeping its absolute wake at 15.
        s.event_send(TaskId(0), EventSet(0x4)).unwrap();
        assert_eq!(state(&s, 0), TaskState::Ready);
        assert_eq!(s.task(TaskId(1)).unwrap().delta(), 15);
        assert_eq!(s.delayed.front(), Some(TaskId(1)));
        assert_single_membership(&s);
    }

    #[test]
    fn event_timeout_expires_without_the_event() {
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4)]);
        s.task_mut(TaskId(0)).unwrap().events_mut().wanted = EventSet(0x8);
        start(&mut s);

        s.event_park_current_timeout(10).unwrap();
        let _ = s.swap_after_block(BlockCause::Events).unwrap();
        settle(&mut s);

        for _ in 0..11 {
            s.tick();
        }
        // Timed out: back in its group, but the wanted set is unsatisfied.
        assert_eq!(state(&s, 0), TaskState::Ready);
        s.schedule(0, TaskId(0)).unwrap();
        settle(&mut s);
        assert_eq!(s.event_poll_current().unwrap(), None);
    }

    #[test]
    fn terminate_tracks_survivors_and_shutdown() {
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4)]);
        start(&mut s);

        match s.terminate_current(42).unwrap() {
            Terminate::Switched(Switch::Scheduled) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        settle(&mut s);
        assert_eq!(state(&s, 0), TaskState::Terminated);
        assert_eq!(s.task(TaskId(0)).unwrap().exit_code(), 42);
        assert_eq!(s.current(), Some(TaskId(1)));

        // Last task out flips the shutdown signal (S7).
        assert_eq!(s.terminate_current(7).unwrap(), Terminate::ShutDown);
        assert_single_membership(&s);
    }

    #[test]
    fn status_machine_rejects_illegal_transitions() {
        let mut s = Sched::new();
        s.initialize();
        assert_eq!(
            s.set_status(KernelStatus::Running),
            Err(SchedError::InvalidTransition)
        );
        // The failed transition itself is sticky.
        assert_eq!(s.status(), KernelStatus::Error);
    }

    #[test]
    fn context_switch_banks_the_outgoing_stack_pointer() {
        let mut s = sched_with(&[(0, 0, 4), (1, 0, 4)]);
        start(&mut s);
        s.task_mut(TaskId(1)).unwrap().set_saved_sp(0x2000_1000);

        s.schedule(0, TaskId(1)).unwrap();
        let sp = s.context_switch(0x2000_0ff0).unwrap();
        assert_eq!(sp, 0x2000_1000);
        assert_eq!(s.task(TaskId(0)).unwrap().saved_sp(), 0x2000_0ff0);
    }

    #[test]
    fn context_switch_releases_the_critical_section() {
        let mut s = sched_with(&[(0, 0, 4)]);
        start(&mut s);
        s.set_critical(true);
        s.schedule(0, TaskId(0)).unwrap();
        s.context_switch(0);
        assert!(!s.in_critical());
    }

    #[test]
    fn reset_returns_to_the_uninitialized_state() {
        let mut s = sched_with(&[(0, 0, 4)]);
        start(&mut s);
        s.reset();
        assert_eq!(s.status(), KernelStatus::NotInitialized);
        assert_eq!(s.task_count(), 0);
        assert!(s.current().is_none());
        assert!(s.task(TaskId(0)).is_err());
    }

    #[test]
    fn rendezvous_buffer_is_bounded_by_config() {
        // Guard against MAX_MESSAGE_SIZE drifting below what the queues
        // assume elsewhere.
        assert!(MAX_MESSAGE_SIZE >= 4);
    }
}
