//! # Scheduler
//!
//! Priority-ordered round-robin dispatch for ringkern.
//!
//! ## Structure
//!
//! Every priority level with at least one live task has a [`PriorityChain`].
//! Chains form a list sorted by descending priority; each chain owns a
//! circular ring of the tasks at its level and a `current` cursor into that
//! ring. Both the TCBs and the chains live in fixed arenas and are linked by
//! index. A chain's slot is its priority, so looking one up is O(1).
//!
//! ## Dispatch
//!
//! On every switch:
//! 1. **Reap**: a zombie current task is unlinked and its stack freed. If only
//!    the idle task is left it is told to exit; if nothing is left the kernel
//!    drops back to single-task mode and resumes the boot context.
//! 2. **Save**: the outgoing task's stack pointer is stored, a running task
//!    becomes sleeping.
//! 3. **Select**: starting at the highest chain, each ring is scanned from
//!    just after its cursor. A sleeping task wins at once. A waiting task
//!    wins if a shutdown was requested (wake value 0) or its condition
//!    polls non-zero. Exhausting the lowest chain wraps to the highest once.
//! 4. **Resume**: the winner becomes current and gets a fresh timeslice.
//!
//! The scheduler never touches hardware. The Cortex-M port feeds it stack
//! pointers from PendSV and ticks from SysTick; tests feed it directly.

use crate::arch::frame::{self, Vectors};
use crate::config::{
    DEFAULT_TIMESLICE, KILLED_EXIT_CODE, MAX_TASKS, MIN_TIMESLICE, PRIORITY_LEVELS, PRIO_HIGHEST,
    PRIO_IDLE, PRIO_LOWEST,
};
use crate::err::{fatal, KernelError};
use crate::heap::{Allocator, Owner};
use crate::task::{Stack, Task, TaskFlags, TaskId, TaskKind, TaskSpec, TaskState};
use crate::time::{ms_to_ticks, Timestamp};
use crate::wait::{WaitCondition, WAKE_READY, WAKE_SHUTDOWN};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// One node of the sorted priority list.
#[derive(Debug, Clone, Copy)]
pub struct PriorityChain {
    pub priority: u8,
    /// Next lower priority chain.
    pub next: Option<usize>,
    /// Next higher priority chain.
    pub prev: Option<usize>,
    /// Ring cursor: the task most recently dispatched from this level.
    pub current: usize,
}

/// Who owns the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    /// The boot context that called `init` and `start`. Not a task.
    Boot,
    Task(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No dispatching: before `start`, and for good once every task died.
    Single,
    Multi,
}

/// What the caller of [`Scheduler::block_current`] has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// Do not block; return this wake value right away.
    Immediate(u32),
    /// The task is now waiting; yield until a wake value arrives.
    Blocked,
    /// No scheduler is running; poll the condition in place.
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The target is the caller, which has to exit on its own.
    SelfExit,
    /// The target will run the exit path the next time it is dispatched.
    Redirected,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// All scheduler state. One instance, owned by the kernel.
pub struct Scheduler {
    tasks: [Option<Task>; MAX_TASKS],
    generations: [u16; MAX_TASKS],
    chains: [Option<PriorityChain>; PRIORITY_LEVELS],
    /// Highest priority chain.
    head: Option<usize>,
    current: Context,
    /// Saved stack pointer of the boot context.
    boot_sp: usize,
    mode: Mode,
    live: usize,
    kernel: usize,
    timeslice: u8,
    slice_left: u8,
    now: Timestamp,
    idle: Option<TaskId>,
    vectors: Vectors,
}

impl Scheduler {
    pub fn new(vectors: Vectors) -> Self {
        Self {
            tasks: [const { None }; MAX_TASKS],
            generations: [0; MAX_TASKS],
            chains: [None; PRIORITY_LEVELS],
            head: None,
            current: Context::Boot,
            boot_sp: 0,
            mode: Mode::Single,
            live: 0,
            kernel: 0,
            timeslice: DEFAULT_TIMESLICE,
            slice_left: DEFAULT_TIMESLICE,
            now: Timestamp::ZERO,
            idle: None,
            vectors,
        }
    }

    // -----------------------------------------------------------------------
    // Arena access
    // -----------------------------------------------------------------------

    fn tcb(&self, i: usize) -> &Task {
        match self.tasks.get(i).and_then(Option::as_ref) {
            Some(t) => t,
            None => fatal("ring links to an empty task slot"),
        }
    }

    fn tcb_mut(&mut self, i: usize) -> &mut Task {
        match self.tasks.get_mut(i).and_then(Option::as_mut) {
            Some(t) => t,
            None => fatal("ring links to an empty task slot"),
        }
    }

    fn chain(&self, c: usize) -> &PriorityChain {
        match self.chains[c].as_ref() {
            Some(ch) => ch,
            None => fatal("task links to a missing priority chain"),
        }
    }

    fn chain_mut(&mut self, c: usize) -> &mut PriorityChain {
        match self.chains[c].as_mut() {
            Some(ch) => ch,
            None => fatal("task links to a missing priority chain"),
        }
    }

    /// Slot index for a live handle.
    fn resolve(&self, id: TaskId) -> Result<usize, KernelError> {
        match self.tasks.get(id.index()).and_then(Option::as_ref) {
            Some(t) if t.id == id => Ok(id.index()),
            _ => Err(KernelError::NoSuchTask),
        }
    }

    fn current_index(&self) -> Option<usize> {
        match self.current {
            Context::Task(i) => Some(i),
            Context::Boot => None,
        }
    }

    // -----------------------------------------------------------------------
    // Ring maintenance
    // -----------------------------------------------------------------------

    /// Put task `i` at the back of the ring for `priority`, creating the
    /// chain in sorted position if this is the first task at that level.
    fn link(&mut self, i: usize, priority: u8) {
        let c = priority as usize;
        match self.chains[c] {
            Some(ch) => {
                // Back of the queue is just before the cursor.
                let cur = ch.current;
                let tail = self.tcb(cur).prev;
                {
                    let t = self.tcb_mut(i);
                    t.prev = tail;
                    t.next = cur;
                }
                self.tcb_mut(tail).next = i;
                self.tcb_mut(cur).prev = i;
            }
            None => {
                let mut prev = None;
                let mut next = self.head;
                while let Some(n) = next {
                    if self.chain(n).priority <= priority {
                        break;
                    }
                    prev = Some(n);
                    next = self.chain(n).next;
                }
                self.chains[c] = Some(PriorityChain {
                    priority,
                    next,
                    prev,
                    current: i,
                });
                match prev {
                    Some(p) => self.chain_mut(p).next = Some(c),
                    None => self.head = Some(c),
                }
                if let Some(n) = next {
                    self.chain_mut(n).prev = Some(c);
                }
                let t = self.tcb_mut(i);
                t.next = i;
                t.prev = i;
            }
        }
        self.tcb_mut(i).chain = c;
    }

    /// Take task `i` off its ring, dropping the chain if the ring empties.
    fn unlink(&mut self, i: usize) {
        let (c, next, prev) = {
            let t = self.tcb(i);
            (t.chain, t.next, t.prev)
        };

        if next == i {
            if let Some(ch) = self.chains[c].take() {
                match ch.prev {
                    Some(p) => self.chain_mut(p).next = ch.next,
                    None => self.head = ch.next,
                }
                if let Some(n) = ch.next {
                    self.chain_mut(n).prev = ch.prev;
                }
            }
            return;
        }

        self.tcb_mut(prev).next = next;
        self.tcb_mut(next).prev = prev;
        let ch = self.chain_mut(c);
        if ch.current == i {
            ch.current = prev;
        }
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Create a task. It is runnable as soon as dispatch picks it.
    ///
    /// Fails without side effects if the priority or stack size is out of
    /// range, the task table is full, or the stack cannot be allocated.
    pub fn launch<A: Allocator>(&mut self, heap: &mut A, spec: &TaskSpec) -> Result<TaskId, KernelError> {
        let valid = match spec.kind {
            TaskKind::Idle => spec.priority == PRIO_IDLE,
            _ => (PRIO_LOWEST..=PRIO_HIGHEST).contains(&spec.priority),
        };
        if !valid {
            return Err(KernelError::InvalidPriority(spec.priority));
        }
        if spec.stack_size < frame::MIN_STACK_BYTES {
            return Err(KernelError::StackTooSmall(spec.stack_size));
        }
        let slot = self
            .tasks
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoTaskSlot)?;

        // Stacks belong to the kernel, not the launching task, so a parent
        // exiting never frees a child's stack.
        let base = heap.allocate(spec.stack_size, Owner::Kernel)?;
        let stack = Stack::new(base, spec.stack_size);

        // SAFETY: the stack was just allocated and is at least
        // MIN_STACK_BYTES long.
        let sp = unsafe {
            frame::init(
                stack.top(),
                spec.entry as usize,
                spec.argc,
                spec.argv as usize,
                &self.vectors,
            )
        };

        let id = TaskId::new(slot as u8, self.generations[slot]);
        let parent = self.current_index().map(|i| self.tcb(i).id);
        let task = Task::new(id, spec, stack, sp, parent);
        let kernel = task.is_kernel();
        self.tasks[slot] = Some(task);
        self.link(slot, spec.priority);

        self.live += 1;
        if kernel {
            self.kernel += 1;
        }
        if spec.kind == TaskKind::Idle {
            self.idle = Some(id);
        }

        log::trace!(
            "launched task {}.{} prio {} ({:?}), {} live",
            slot,
            id.generation(),
            spec.priority,
            spec.kind,
            self.live
        );
        Ok(id)
    }

    /// Switch from single-task mode to dispatching. The caller yields right
    /// after to hand the CPU to the first task.
    pub fn start(&mut self) {
        if self.idle.is_none() {
            fatal("scheduler started without an idle task");
        }
        self.mode = Mode::Multi;
        log::debug!("multitasking started with {} tasks", self.live);
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pick the next task. Takes the outgoing context's stack pointer and
    /// returns the one to resume.
    pub fn dispatch<A: Allocator>(&mut self, heap: &mut A, old_sp: usize) -> usize {
        if self.mode == Mode::Single {
            return old_sp;
        }

        match self.current {
            Context::Boot => self.boot_sp = old_sp,
            Context::Task(i) => {
                let (state, in_bounds) = {
                    let t = self.tcb(i);
                    (t.state, t.stack.contains(old_sp))
                };
                match state {
                    TaskState::Zombie => {
                        if let Some(sp) = self.reap(heap, i) {
                            return sp;
                        }
                    }
                    _ if !in_bounds => {
                        log::error!("task {} sp {:#x} outside its stack", i, old_sp);
                        fatal("task stack overflow");
                    }
                    TaskState::Running => {
                        let t = self.tcb_mut(i);
                        t.state = TaskState::Sleeping;
                        t.sp = old_sp;
                    }
                    TaskState::Sleeping | TaskState::Waiting => self.tcb_mut(i).sp = old_sp,
                }
            }
        }

        let next = self.select();
        let c = self.tcb(next).chain;
        self.chain_mut(c).current = next;
        self.current = Context::Task(next);
        self.slice_left = self.timeslice;

        let t = self.tcb_mut(next);
        t.state = TaskState::Running;
        t.sp
    }

    /// Release a zombie. Returns the boot context's stack pointer if that
    /// was the last task.
    fn reap<A: Allocator>(&mut self, heap: &mut A, i: usize) -> Option<usize> {
        self.unlink(i);
        let task = match self.tasks[i].take() {
            Some(t) => t,
            None => fatal("reaping an empty task slot"),
        };
        self.generations[i] = self.generations[i].wrapping_add(1);

        // We are still running on this stack. Nothing can preempt the switch,
        // and a deferred free only rewrites the block tag.
        if let Err(e) = heap.free(task.stack.base().as_ptr()) {
            log::warn!("task {} stack release failed: {}", i, e);
        }

        self.live -= 1;
        if task.is_kernel() {
            self.kernel -= 1;
        }
        if task.is_idle() {
            self.idle = None;
        }
        log::trace!("reaped task {} exit {:?}, {} live", i, task.exit_code, self.live);

        match self.live {
            0 => {
                self.mode = Mode::Single;
                self.current = Context::Boot;
                log::debug!("last task gone, back to single-task mode");
                Some(self.boot_sp)
            }
            1 => {
                // Only idle may be left. Make it exit the next time it runs.
                let idle = match self.idle.map(|id| self.resolve(id)) {
                    Some(Ok(idx)) => idx,
                    _ => fatal("idle task missing"),
                };
                let vectors = self.vectors;
                let t = self.tcb_mut(idle);
                // SAFETY: idle is not running, so its saved frame is valid.
                unsafe { frame::redirect_to_exit(t.sp, &vectors, 0) };
                t.wait = None;
                t.state = TaskState::Sleeping;
                None
            }
            _ => None,
        }
    }

    /// Scan for the next runnable task.
    fn select(&mut self) -> usize {
        let first = match self.head {
            Some(h) => h,
            None => fatal("no priority chains"),
        };
        let mut c = first;
        let mut wrapped = false;

        loop {
            let start = self.chain(c).current;
            let mut t = self.tcb(start).next;
            loop {
                if self.is_selectable(t) {
                    return t;
                }
                if t == start {
                    break;
                }
                t = self.tcb(t).next;
            }

            c = match self.chain(c).next {
                Some(n) => n,
                None if !wrapped => {
                    wrapped = true;
                    first
                }
                None => fatal("no runnable task, idle task missing"),
            };
        }
    }

    /// Whether task `i` can run now. Delivers its wake value if it was
    /// waiting.
    fn is_selectable(&mut self, i: usize) -> bool {
        let now = self.now;
        let t = self.tcb_mut(i);
        match t.state {
            TaskState::Sleeping => true,
            TaskState::Waiting => {
                let value = if t.shutdown_requested() {
                    WAKE_SHUTDOWN
                } else {
                    match t.wait {
                        Some(cond) => match cond.poll(now, t.id) {
                            0 => return false,
                            v => v,
                        },
                        None => WAKE_READY,
                    }
                };
                t.wake_with(value);
                true
            }
            TaskState::Running | TaskState::Zombie => false,
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Advance the clock by one tick. Returns whether the timeslice ran out
    /// and a switch should happen. While `lock_held`, an expired slice is
    /// retried on the next tick.
    pub fn tick(&mut self, lock_held: bool) -> bool {
        self.now.bump();
        if self.mode == Mode::Single {
            return false;
        }
        self.slice_left = self.slice_left.saturating_sub(1);
        if self.slice_left > 0 {
            return false;
        }
        if lock_held {
            self.slice_left = 1;
            return false;
        }
        true
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Set the multitasking timeslice. Refused at or below the minimum.
    pub fn set_timeslice(&mut self, ms: u32) -> bool {
        let ticks = ms_to_ticks(ms).min(u8::MAX as u64) as u8;
        if ticks <= MIN_TIMESLICE {
            return false;
        }
        self.timeslice = ticks;
        self.slice_left = self.slice_left.min(ticks);
        true
    }

    pub fn timeslice(&self) -> u8 {
        self.timeslice
    }

    // -----------------------------------------------------------------------
    // Current-task operations
    // -----------------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Handle of the running task, or [`TaskId::BOOT`] for the boot context.
    pub fn current(&self) -> TaskId {
        match self.current_index() {
            Some(i) => self.tcb(i).id,
            None => TaskId::BOOT,
        }
    }

    pub fn current_is_kernel(&self) -> bool {
        self.current_index().is_some_and(|i| self.tcb(i).is_kernel())
    }

    /// Heap owner tag for allocations made by the running code.
    pub fn current_owner(&self) -> Owner {
        match self.current_index() {
            Some(i) => Owner::Task(self.tcb(i).id),
            None => Owner::Single,
        }
    }

    /// Put the running task to sleep on `cond`.
    pub fn block_current(&mut self, cond: WaitCondition) -> Block {
        let i = match (self.mode, self.current_index()) {
            (Mode::Multi, Some(i)) => i,
            _ => return Block::Polling,
        };
        let t = self.tcb_mut(i);
        if t.shutdown_requested() {
            return Block::Immediate(WAKE_SHUTDOWN);
        }
        t.block_on(cond);
        Block::Blocked
    }

    /// Wake value delivered to the running task, if dispatch delivered one
    /// since it blocked.
    pub fn take_wake_value(&mut self) -> Option<u32> {
        let i = self.current_index()?;
        self.tcb_mut(i).wake.take()
    }

    /// Mark the running task as finished. It is reaped on the next dispatch.
    ///
    /// Everything a user task allocated goes back to `heap` right away and
    /// the number of blocks released is returned. Kernel tasks keep their
    /// blocks. The stack goes at reap time.
    pub fn exit_current<A: Allocator>(&mut self, heap: &mut A, code: i32) -> usize {
        let i = match self.current_index() {
            Some(i) => i,
            None => return 0,
        };
        let t = self.tcb_mut(i);
        t.exit_code = Some(code);
        t.wait = None;
        t.state = TaskState::Zombie;

        if t.is_kernel() {
            return 0;
        }
        let id = t.id;
        let released = heap.reclaim_owner(Owner::Task(id));
        log::trace!("task {} exit {}, reclaimed {} blocks", i, code, released);
        released
    }

    // -----------------------------------------------------------------------
    // Kill & shutdown
    // -----------------------------------------------------------------------

    /// Force `target` to exit with [`KILLED_EXIT_CODE`].
    pub fn kill(&mut self, target: TaskId) -> Result<KillOutcome, KernelError> {
        let i = self.resolve(target)?;
        if self.tcb(i).is_idle() {
            return Err(KernelError::IdleTask);
        }
        if self.current_index() == Some(i) {
            return Ok(KillOutcome::SelfExit);
        }
        self.redirect_to_exit(i);
        log::trace!("killed task {}", i);
        Ok(KillOutcome::Redirected)
    }

    fn redirect_to_exit(&mut self, i: usize) {
        let vectors = self.vectors;
        let t = self.tcb_mut(i);
        // SAFETY: `t` is not the running task, so its frame is saved.
        unsafe { frame::redirect_to_exit(t.sp, &vectors, KILLED_EXIT_CODE) };
        t.wait = None;
        t.state = TaskState::Sleeping;
    }

    /// Force every task at or below `priority` to exit, sparing the caller
    /// and the idle task. Returns how many were hit.
    pub fn killall(&mut self, priority: u8) -> usize {
        let me = self.current_index();
        let mut killed = 0;
        let mut c = self.head;
        while let Some(ch) = c {
            let chain = *self.chain(ch);
            c = chain.next;
            if chain.priority > priority {
                continue;
            }
            let mut t = chain.current;
            loop {
                let next = self.tcb(t).next;
                if Some(t) != me && !self.tcb(t).is_idle() {
                    self.redirect_to_exit(t);
                    killed += 1;
                }
                t = next;
                if t == chain.current {
                    break;
                }
            }
        }
        killed
    }

    /// Ask `target` to shut down. A wait it is blocked in returns early.
    pub fn shutdown_task(&mut self, target: TaskId) -> Result<(), KernelError> {
        let i = self.resolve(target)?;
        self.tcb_mut(i).flags.insert(TaskFlags::SHUTDOWN);
        Ok(())
    }

    /// Ask every task whose flags intersect `flags` to shut down, except the
    /// caller and the idle task. Returns how many were asked.
    pub fn shutdown_tasks(&mut self, flags: TaskFlags) -> usize {
        let me = self.current_index();
        let mut n = 0;
        for (i, slot) in self.tasks.iter_mut().enumerate() {
            if let Some(t) = slot {
                if Some(i) != me && !t.is_idle() && t.flags.intersects(flags) {
                    t.flags.insert(TaskFlags::SHUTDOWN);
                    n += 1;
                }
            }
        }
        n
    }

    /// Whether the running task was asked to shut down.
    pub fn shutdown_requested(&self) -> bool {
        self.current_index()
            .is_some_and(|i| self.tcb(i).shutdown_requested())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Live tasks, idle included.
    pub fn task_count(&self) -> usize {
        self.live
    }

    pub fn kernel_task_count(&self) -> usize {
        self.kernel
    }

    /// Whether anything besides kernel tasks is alive.
    pub fn user_tasks_running(&self) -> bool {
        self.live > self.kernel
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.resolve(id).ok().map(|i| self.tcb(i).state)
    }

    pub fn parent_of(&self, id: TaskId) -> Option<TaskId> {
        self.resolve(id).ok().and_then(|i| self.tcb(i).parent)
    }

    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle
    }

    /// Priorities that currently have a chain, highest first.
    pub fn priorities(&self) -> impl Iterator<Item = u8> + '_ {
        let mut c = self.head;
        core::iter::from_fn(move || {
            let ch = self.chains[c?].as_ref()?;
            c = ch.next;
            Some(ch.priority)
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
