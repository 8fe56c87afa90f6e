//! # Task Control Block
//!
//! Defines the task model for ringkern. A task is an entry point, a stack
//! carved out of the heap, and the bookkeeping the scheduler needs to put it
//! on a priority ring and wake it up again.
//!
//! TCBs live in a fixed arena inside the scheduler and refer to each other
//! by slot index. A [`TaskId`] is the only handle that leaves the kernel; it
//! pairs the slot index with a generation so a handle to a reaped task never
//! aliases whatever reuses the slot.

#[cfg(feature = "tasks")]
use core::ptr::NonNull;

#[cfg(feature = "tasks")]
use bitflags::bitflags;

#[cfg(feature = "tasks")]
use crate::config::{DEFAULT_STACK_SIZE, PRIO_IDLE, PRIO_NORMAL, WORD};
#[cfg(feature = "tasks")]
use crate::wait::WaitCondition;

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Handle to a task: arena slot plus generation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u8,
    generation: u16,
}

impl TaskId {
    /// Stands for the boot context, which is not a task. Its index is past
    /// the end of any task arena.
    pub const BOOT: TaskId = TaskId::new(u8::MAX, 0);

    /// A slot is good for 65536 reuses before an old handle can alias a
    /// new task in it again.
    pub const fn new(index: u8, generation: u16) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u16 {
        self.generation
    }

    /// Heap owner tag for this task. Never 0 and far below the reserved
    /// tags at the top of the word range.
    pub(crate) const fn to_tag(self) -> usize {
        1 + self.index as usize + ((self.generation as usize) << 8)
    }

    pub(crate) const fn from_tag(tag: usize) -> Option<Self> {
        if tag == 0 || tag > 1 << 24 {
            return None;
        }
        let raw = tag - 1;
        Some(Self::new((raw & 0xff) as u8, (raw >> 8) as u16))
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///            dispatch()                    wait_event()
///   Sleeping ─────────► Running ─────────────────────► Waiting
///      ▲                 │  │                              │
///      └── tick/yield ───┘  │ exit()          condition != 0
///                           ▼                              │
///                         Zombie            Running ◄──────┘
/// ```
///
/// `Sleeping` means runnable but not on the CPU.
#[cfg(feature = "tasks")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Sleeping,
    Waiting,
    Zombie,
}

#[cfg(feature = "tasks")]
bitflags! {
    /// Independent per-task flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// Entry point lives in the kernel image.
        const KERNEL   = 1 << 0;
        /// Entry point lives in a loaded program.
        const USER     = 1 << 1;
        /// The idle task.
        const IDLE     = 1 << 2;
        /// A cooperative shutdown was requested.
        const SHUTDOWN = 1 << 3;
    }
}

/// What kind of code a task runs. Decides the flags and whether its heap
/// blocks are reclaimed when it exits.
#[cfg(feature = "tasks")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Kernel,
    User,
    Idle,
}

#[cfg(feature = "tasks")]
impl TaskKind {
    pub fn flags(self) -> TaskFlags {
        match self {
            TaskKind::Kernel => TaskFlags::KERNEL,
            TaskKind::User => TaskFlags::USER,
            TaskKind::Idle => TaskFlags::IDLE | TaskFlags::KERNEL,
        }
    }
}

/// Task entry point: `(argc, argv) -> exit code`. Returning from it is the
/// same as calling exit with the returned value.
#[cfg(feature = "tasks")]
pub type TaskEntry = extern "C" fn(usize, *const *const u8) -> i32;

// ---------------------------------------------------------------------------
// Launch parameters
// ---------------------------------------------------------------------------

/// Everything needed to launch a task.
#[cfg(feature = "tasks")]
#[derive(Debug, Clone, Copy)]
pub struct TaskSpec {
    pub entry: TaskEntry,
    pub argc: usize,
    pub argv: *const *const u8,
    pub priority: u8,
    /// Stack size in bytes.
    pub stack_size: usize,
    pub kind: TaskKind,
}

#[cfg(feature = "tasks")]
impl TaskSpec {
    /// A user task with no arguments, normal priority and the default stack.
    pub fn new(entry: TaskEntry) -> Self {
        Self {
            entry,
            argc: 0,
            argv: core::ptr::null(),
            priority: PRIO_NORMAL,
            stack_size: DEFAULT_STACK_SIZE,
            kind: TaskKind::User,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn args(mut self, argc: usize, argv: *const *const u8) -> Self {
        self.argc = argc;
        self.argv = argv;
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Launch parameters for the idle task.
    pub fn idle(entry: TaskEntry, stack_size: usize) -> Self {
        Self::new(entry)
            .priority(PRIO_IDLE)
            .stack_size(stack_size)
            .kind(TaskKind::Idle)
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

/// A task stack borrowed from the heap. Owned by exactly one TCB and
/// released by the scheduler when that task is reaped.
#[cfg(feature = "tasks")]
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    bytes: usize,
}

#[cfg(feature = "tasks")]
impl Stack {
    pub fn new(base: NonNull<u8>, bytes: usize) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// One past the highest usable byte, rounded down to a word.
    pub fn top(&self) -> usize {
        (self.base.as_ptr() as usize + self.bytes) & !(WORD - 1)
    }

    /// Whether a saved stack pointer still points into this stack.
    pub fn contains(&self, sp: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        sp >= base && sp <= base + self.bytes
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block.
///
/// `chain`, `next` and `prev` are arena indices: the priority chain this
/// task belongs to and its neighbours on that chain's circular ring. A task
/// alone on its ring is its own neighbour.
#[cfg(feature = "tasks")]
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    /// Saved process stack pointer. Valid whenever the task is not running.
    pub sp: usize,
    pub state: TaskState,
    pub flags: TaskFlags,
    pub priority: u8,
    pub chain: usize,
    pub next: usize,
    pub prev: usize,
    /// `None` for tasks launched from the boot context.
    pub parent: Option<TaskId>,
    pub stack: Stack,
    /// Pending wake condition; only set while `Waiting`.
    pub wait: Option<WaitCondition>,
    /// Value delivered by dispatch when the task was woken.
    pub wake: Option<u32>,
    pub exit_code: Option<i32>,
}

#[cfg(feature = "tasks")]
impl Task {
    pub fn new(id: TaskId, spec: &TaskSpec, stack: Stack, sp: usize, parent: Option<TaskId>) -> Self {
        Self {
            id,
            sp,
            state: TaskState::Sleeping,
            flags: spec.kind.flags(),
            priority: spec.priority,
            chain: 0,
            next: id.index(),
            prev: id.index(),
            parent,
            stack,
            wait: None,
            wake: None,
            exit_code: None,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.flags.contains(TaskFlags::IDLE)
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.flags.contains(TaskFlags::KERNEL)
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.flags.contains(TaskFlags::SHUTDOWN)
    }

    /// Put the task to sleep on `cond`.
    pub fn block_on(&mut self, cond: WaitCondition) {
        self.state = TaskState::Waiting;
        self.wait = Some(cond);
        self.wake = None;
    }

    /// Deliver a wake value and make the task runnable.
    pub fn wake_with(&mut self, value: u32) {
        self.wait = None;
        self.wake = Some(value);
        self.state = TaskState::Running;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_tag_roundtrip_and_range() {
        let id = TaskId::new(15, 200);
        let tag = id.to_tag();
        assert_ne!(tag, 0);
        assert!(tag < usize::MAX - 2);
        assert_eq!(TaskId::from_tag(tag), Some(id));
        assert_eq!(TaskId::from_tag(0), None);
    }

    #[test]
    fn test_largest_tag_stays_below_reserved_tags() {
        let id = TaskId::new(u8::MAX - 1, u16::MAX);
        assert_eq!(TaskId::from_tag(id.to_tag()), Some(id));
        assert_eq!(TaskId::from_tag((1 << 24) + 1), None);
    }

    #[test]
    fn test_generation_distinguishes_handles() {
        let a = TaskId::new(3, 0);
        let b = TaskId::new(3, 1);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_ne!(a.to_tag(), b.to_tag());
    }

    #[cfg(feature = "tasks")]
    extern "C" fn nop(_argc: usize, _argv: *const *const u8) -> i32 {
        0
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_kind_flags() {
        assert_eq!(TaskKind::User.flags(), TaskFlags::USER);
        assert!(TaskKind::Idle.flags().contains(TaskFlags::IDLE));
        assert!(TaskKind::Idle.flags().contains(TaskFlags::KERNEL));
        assert!(!TaskKind::Kernel.flags().intersects(TaskFlags::USER | TaskFlags::SHUTDOWN));
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_spec_builder_defaults() {
        let spec = TaskSpec::new(nop);
        assert_eq!(spec.priority, PRIO_NORMAL);
        assert_eq!(spec.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(spec.kind, TaskKind::User);

        let idle = TaskSpec::idle(nop, 128);
        assert_eq!(idle.priority, PRIO_IDLE);
        assert_eq!(idle.kind, TaskKind::Idle);
    }

    #[cfg(feature = "tasks")]
    #[test]
    fn test_tcb_initialization_and_wake() {
        let mut mem = [0usize; 32];
        let base = NonNull::new(mem.as_mut_ptr() as *mut u8).unwrap();
        let stack = Stack::new(base, 32 * WORD);
        let top = stack.top();
        assert!(stack.contains(top));

        let id = TaskId::new(2, 0);
        let mut tcb = Task::new(id, &TaskSpec::new(nop).priority(7), stack, top, None);
        assert_eq!(tcb.state, TaskState::Sleeping);
        assert_eq!(tcb.priority, 7);
        assert_eq!((tcb.next, tcb.prev), (2, 2));
        assert!(!tcb.is_idle());

        tcb.block_on(WaitCondition::Custom { poll: |_| 0, arg: 0 });
        assert_eq!(tcb.state, TaskState::Waiting);
        assert!(tcb.wait.is_some());

        tcb.wake_with(5);
        assert_eq!(tcb.state, TaskState::Running);
        assert_eq!(tcb.wake, Some(5));
        assert!(tcb.wait.is_none());
    }
}
