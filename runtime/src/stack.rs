//! Task stacks.
//!
//! A task's stack is a word array in runtime-managed memory, growing down
//! from `hi`. Each frame is three header words followed by the locals:
//!
//! ```text
//!   fp + 0     saved fp of the caller (0 for the outermost frame)
//!   fp + 8     function id
//!   fp + 16    pc
//!   fp + 24..  locals
//! ```
//!
//! Stacks start at [`MIN_STACK`] and double when a push would cross the
//! guard, up to the configured maximum. Growing copies the used part to the
//! top of a new stack and relocates every word that points into the old
//! one: frame links, pointer locals, deferred call frames and arguments,
//! and the handoff word. The collector halves stacks that use less than a
//! quarter of their size while it scans them.

use std::{
    collections::HashMap,
    io::Write,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use heap::{
    AllocError, GcWork, Heap, HeapInner, Lock, LockRank,
    fatal::{throw, throw_with},
    gc::barrier::{load_ptr, store_word},
    sizeclass::{PAGE_SIZE, WORD},
    span::SpanPtr,
};

use crate::{
    context::TaskContext,
    defer::Defer,
    funcs::{FuncId, FuncInfo, FuncTable},
    runtime::RuntimeInner,
    task::{Task, TaskFlags, TaskStatus},
};

pub const MIN_STACK: usize = 8 << 10;

/// Bytes below the guard kept free for runtime use.
pub const STACK_GUARD: usize = 32 * WORD;

/// Guard value that sends every push to the slow path.
pub(crate) const STACK_PREEMPT: usize = usize::MAX;

pub(crate) const FRAME_HEADER: usize = 3;

/// Pooled stack sizes: 8, 16 and 32 KiB.
const ORDERS: usize = 3;

/// Pooled stacks are carved out of spans this big.
const POOL_SPAN_BYTES: usize = 32 << 10;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("stack of {needed} bytes exceeds the {max} byte limit")]
    Overflow { needed: usize, max: usize },
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

// ── Stack memory ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stack {
    pub lo: usize,
    pub hi: usize,
}

impl Stack {
    pub fn size(&self) -> usize {
        self.hi - self.lo
    }
}

pub(crate) struct StackAllocator {
    heap: Heap,
    pools: Lock<[Vec<usize>; ORDERS]>,
    large: Lock<HashMap<usize, SpanPtr>>,
    in_use: AtomicUsize,
}

fn order_of(size: usize) -> Option<usize> {
    (MIN_STACK..=POOL_SPAN_BYTES)
        .contains(&size)
        .then(|| (size / MIN_STACK).trailing_zeros() as usize)
        .filter(|&order| MIN_STACK << order == size)
}

impl StackAllocator {
    pub(crate) fn new(heap: Heap) -> Self {
        Self {
            heap,
            pools: Lock::new(LockRank::StackPool, Default::default()),
            large: Lock::new(LockRank::StackPool, HashMap::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    /// A stack of `size` bytes, a power of two no smaller than
    /// [`MIN_STACK`]. Contents are unspecified.
    pub(crate) fn alloc(&self, size: usize) -> Result<Stack, AllocError> {
        debug_assert!(size.is_power_of_two() && size >= MIN_STACK);
        let lo = match order_of(size) {
            Some(order) => {
                let mut pools = self.pools.lock();
                if pools[order].is_empty() {
                    let span = self.heap.pages.alloc_manual(POOL_SPAN_BYTES / PAGE_SIZE)?;
                    let base = span.base();
                    pools[order].extend((0..POOL_SPAN_BYTES / size).rev().map(|i| base + i * size));
                }
                pools[order].pop().ok_or(AllocError::OutOfMemory {
                    requested: size,
                    limit: self.heap.pages.limit(),
                })?
            }
            None => {
                let span = self.heap.pages.alloc_manual(size.div_ceil(PAGE_SIZE))?;
                self.large.lock().insert(span.base(), span);
                span.base()
            }
        };
        self.in_use.fetch_add(size, Ordering::Relaxed);
        Ok(Stack { lo, hi: lo + size })
    }

    pub(crate) fn free(&self, stack: Stack) {
        let size = stack.size();
        self.in_use.fetch_sub(size, Ordering::Relaxed);
        match order_of(size) {
            Some(order) => self.pools.lock()[order].push(stack.lo),
            None => {
                let span = self.large.lock().remove(&stack.lo);
                match span {
                    Some(span) => self.heap.pages.free_manual(span),
                    None => throw_with("free of unknown stack", |out| {
                        let _ = writeln!(out, "stack [{:#x}, {:#x})", stack.lo, stack.hi);
                    }),
                }
            }
        }
    }

    /// Bytes of stack handed out to tasks.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

// ── Frames ────────────────────────────────────────────────────────────

#[inline]
fn read(addr: usize) -> usize {
    // SAFETY: callers pass words of a stack the task owns or that is
    // suspended for scanning
    unsafe { load_ptr(addr) }
}

#[inline]
fn write(addr: usize, value: usize) {
    // SAFETY: as for `read`; stack words need no barrier
    unsafe { store_word(addr, value) }
}

/// One frame, as read from the stack.
pub(crate) struct Frame {
    pub fp: usize,
    pub link: usize,
    pub func: FuncId,
    pub pc: u32,
}

impl Frame {
    fn read(fp: usize) -> Self {
        Self {
            fp,
            link: read(fp),
            func: FuncId(read(fp + WORD) as u32),
            pc: read(fp + 2 * WORD) as u32,
        }
    }

    #[inline]
    pub fn local_addr(&self, i: usize) -> usize {
        self.fp + (FRAME_HEADER + i) * WORD
    }
}

/// Call `f` on every frame from the innermost out. A frame whose function
/// or pointer map is missing is fatal.
pub(crate) fn walk_frames(funcs: &FuncTable, fp: usize, mut f: impl FnMut(&Frame, &FuncInfo, &[u64])) {
    let mut fp = fp;
    while fp != 0 {
        let frame = Frame::read(fp);
        let Some(info) = funcs.get(frame.func) else {
            throw_with("frame of unknown function", |out| {
                let _ = writeln!(out, "frame {fp:#x}, function {:?}", frame.func);
            });
        };
        let Some(bits) = info.pointers_at(frame.pc) else {
            throw_with("missing stack map", |out| {
                let _ = writeln!(out, "function {} pc {}", info.name, frame.pc);
            });
        };
        f(&frame, &info, bits);
        // Reread: a stack copy relinks the frame in `f`.
        fp = read(fp);
    }
}

#[inline]
fn bit(bits: &[u64], i: usize) -> bool {
    bits.get(i / 64).is_some_and(|w| w & (1 << (i % 64)) != 0)
}

impl RuntimeInner {
    /// Shade everything `task`'s stack and deferred calls refer to. The task
    /// must not be running, or must be the caller.
    pub(crate) fn scan_stack(&self, heap: &HeapInner, task: &Task, gcw: &mut GcWork) {
        walk_frames(&self.funcs, task.fp.load(Ordering::Relaxed), |frame, info, bits| {
            // SAFETY: the frame's locals are readable and the task is not
            // changing them
            unsafe { heap.scan_block(frame.local_addr(0), info.nlocals, bits, gcw) };
        });
        // Copied out first: shading may take work buffer locks, which rank
        // below the task's own.
        let mut values: Vec<usize> = task
            .defers
            .lock()
            .iter()
            .flat_map(Defer::pointer_args)
            .collect();
        values.extend(task.panic.lock().iter().flatten().map(|exc| exc.value));
        values.push(task.handoff_value.load(Ordering::Acquire));
        for value in values {
            heap.shade_root(value, gcw);
        }
    }

    /// Every pointer word `task` holds outside the heap, for dumps.
    pub(crate) fn stack_roots(&self, task: &Task, mut f: impl FnMut(bool, usize)) {
        walk_frames(&self.funcs, task.fp.load(Ordering::Relaxed), |frame, info, bits| {
            for i in 0..info.nlocals {
                if bit(bits, i) {
                    f(false, read(frame.local_addr(i)));
                }
            }
        });
        let deferred: Vec<usize> = task
            .defers
            .lock()
            .iter()
            .flat_map(Defer::pointer_args)
            .collect();
        for arg in deferred {
            f(true, arg);
        }
        f(false, task.handoff_value.load(Ordering::Acquire));
    }

    /// Move `task`'s stack to a new one of `new_size` bytes. The task is
    /// either the caller, in `Copystack`, or held for scanning.
    pub(crate) fn copy_stack(&self, task: &Task, new_size: usize) -> Result<(), AllocError> {
        let old = Stack {
            lo: task.stack_lo.load(Ordering::Relaxed),
            hi: task.stack_hi.load(Ordering::Relaxed),
        };
        let sp = task.sp.load(Ordering::Relaxed);
        let fp = task.fp.load(Ordering::Relaxed);
        let used = old.hi - sp;
        if used + STACK_GUARD > new_size {
            throw("stack copy into a stack too small for it");
        }
        let new = self.stacks.alloc(new_size)?;
        let delta = new.hi.wrapping_sub(old.hi);
        let moved = |v: usize| v.wrapping_add(delta);

        // SAFETY: both ranges are stack memory owned by this task and do
        // not overlap
        unsafe { ptr::copy_nonoverlapping(sp as *const u8, moved(sp) as *mut u8, used) };

        let in_old = |v: usize| (old.lo..old.hi).contains(&v);
        let new_fp = if fp == 0 { 0 } else { moved(fp) };
        walk_frames(&self.funcs, new_fp, |frame, info, bits| {
            for i in 0..info.nlocals {
                let slot = frame.local_addr(i);
                let v = read(slot);
                if bit(bits, i) && in_old(v) {
                    write(slot, moved(v));
                }
            }
            if frame.link != 0 {
                write(frame.fp, moved(frame.link));
            }
        });
        for d in task.defers.lock().iter_mut() {
            d.relocate(old.lo, old.hi, delta);
        }
        let handoff = task.handoff_value.load(Ordering::Relaxed);
        if in_old(handoff) {
            task.handoff_value.store(moved(handoff), Ordering::Relaxed);
        }

        task.stack_lo.store(new.lo, Ordering::Relaxed);
        task.stack_hi.store(new.hi, Ordering::Relaxed);
        task.sp.store(moved(sp), Ordering::Relaxed);
        if fp != 0 {
            task.fp.store(moved(fp), Ordering::Relaxed);
        }
        let guard = task.stack_guard.load(Ordering::Relaxed);
        if guard != STACK_PREEMPT {
            task.stack_guard.store(new.lo + STACK_GUARD, Ordering::Relaxed);
        }
        self.stacks.free(old);
        log::trace!(
            "task {}: stack {} -> {} bytes, {used} used",
            task.goid(),
            old.size(),
            new_size
        );
        Ok(())
    }

    /// Halve the stack of a task held for scanning if it uses less than a
    /// quarter of it.
    pub(crate) fn maybe_shrink_stack(&self, task: &Task, status: TaskStatus) {
        if status == TaskStatus::Syscall {
            return;
        }
        let size = task.stack_size();
        if size / 2 < MIN_STACK || task.stack_used() >= size / 4 {
            return;
        }
        if let Err(err) = self.copy_stack(task, size / 2) {
            log::warn!("task {}: stack shrink failed: {err}", task.goid());
        }
    }
}

// ── Frame API ─────────────────────────────────────────────────────────

impl TaskContext {
    /// Push a frame of `func` with zeroed locals. Overflowing the stack
    /// limit is fatal.
    pub fn push_frame(&self, func: FuncId) {
        if let Err(err) = self.try_push_frame(func) {
            let task = self.task();
            throw_with("stack overflow", |out| {
                let _ = writeln!(out, "task {}: {err}", task.goid());
                for name in self.trace() {
                    let _ = writeln!(out, "    {name}");
                }
            });
        }
    }

    /// Push a frame of `func`, reporting overflow to the caller.
    pub fn try_push_frame(&self, func: FuncId) -> Result<(), StackError> {
        let rt = self.rt();
        let task = self.task();
        let Some(info) = rt.funcs.get(func) else {
            throw_with("push of unregistered function", |out| {
                let _ = writeln!(out, "{func:?}");
            });
        };
        let size = (FRAME_HEADER + info.nlocals) * WORD;
        let new_sp = loop {
            let sp = task.sp.load(Ordering::Relaxed);
            let guard = task.stack_guard.load(Ordering::Relaxed);
            match sp.checked_sub(size) {
                Some(new_sp) if new_sp >= guard => break new_sp,
                _ => self.morestack(size)?,
            }
        };
        write(new_sp, task.fp.load(Ordering::Relaxed));
        write(new_sp + WORD, func.0 as usize);
        write(new_sp + 2 * WORD, 0);
        for i in 0..info.nlocals {
            write(new_sp + (FRAME_HEADER + i) * WORD, 0);
        }
        task.fp.store(new_sp, Ordering::Relaxed);
        task.sp.store(new_sp, Ordering::Relaxed);
        Ok(())
    }

    /// Slow path of a push: serve a preemption request, or grow.
    fn morestack(&self, size: usize) -> Result<(), StackError> {
        let rt = self.rt();
        let task = self.task();
        let lo = task.stack_lo.load(Ordering::Relaxed);
        if task
            .stack_guard
            .compare_exchange(
                STACK_PREEMPT,
                lo + STACK_GUARD,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            rt.safepoint();
            if task.flags().contains(TaskFlags::PREEMPT) {
                // Give up the slot at the next suspension point.
                task.set_flags(TaskFlags::YIELD);
            }
            return Ok(());
        }

        let hi = task.stack_hi.load(Ordering::Relaxed);
        let needed = hi - task.sp.load(Ordering::Relaxed) + size + STACK_GUARD;
        let mut new_size = (hi - lo) * 2;
        while new_size < needed {
            new_size *= 2;
        }
        let max = rt.config.max_stack;
        if new_size > max {
            return Err(StackError::Overflow {
                needed: new_size,
                max,
            });
        }
        task.cas_status(TaskStatus::Running, TaskStatus::Copystack);
        let result = rt.copy_stack(task, new_size);
        task.cas_status(TaskStatus::Copystack, TaskStatus::Running);
        result.map_err(StackError::from)
    }

    /// Pop the innermost frame.
    pub fn pop_frame(&self) {
        let rt = self.rt();
        let task = self.task();
        let fp = task.fp.load(Ordering::Relaxed);
        if fp == 0 {
            throw("pop of an empty stack");
        }
        let frame = Frame::read(fp);
        let nlocals = rt.funcs.get(frame.func).map_or(0, |f| f.nlocals);
        task.sp
            .store(fp + (FRAME_HEADER + nlocals) * WORD, Ordering::Relaxed);
        task.fp.store(frame.link, Ordering::Relaxed);
    }

    /// Innermost frame, fatal if there is none.
    fn frame(&self) -> (Frame, usize) {
        let fp = self.task().fp.load(Ordering::Relaxed);
        if fp == 0 {
            throw("no frame on the stack");
        }
        let frame = Frame::read(fp);
        let nlocals = self.rt().funcs.get(frame.func).map_or(0, |f| f.nlocals);
        (frame, nlocals)
    }

    /// Address of local `i` of the innermost frame. Valid only until the
    /// next safe point: a push may grow the stack and a collection may
    /// shrink a suspended task's stack. Kept in a pointer-typed local it is
    /// moved along with the stack.
    pub fn local_addr(&self, i: usize) -> usize {
        let (frame, nlocals) = self.frame();
        if i >= nlocals {
            throw_with("local index out of range", |out| {
                let _ = writeln!(out, "local {i} of {nlocals}");
            });
        }
        frame.local_addr(i)
    }

    pub fn set_local(&self, i: usize, value: usize) {
        write(self.local_addr(i), value);
    }

    pub fn local(&self, i: usize) -> usize {
        read(self.local_addr(i))
    }

    /// Record where the innermost frame is, selecting its pointer map.
    pub fn set_pc(&self, pc: u32) {
        let (frame, _) = self.frame();
        write(frame.fp + 2 * WORD, pc as usize);
    }

    /// Read a word of this task's stack.
    pub fn load_stack(&self, addr: usize) -> usize {
        self.check_stack_addr(addr);
        read(addr)
    }

    /// Write a word of this task's stack.
    pub fn store_stack(&self, addr: usize, value: usize) {
        self.check_stack_addr(addr);
        write(addr, value);
    }

    fn check_stack_addr(&self, addr: usize) {
        let task = self.task();
        let sp = task.sp.load(Ordering::Relaxed);
        let hi = task.stack_hi.load(Ordering::Relaxed);
        if !(sp..hi).contains(&addr) || addr % WORD != 0 {
            throw_with("stack access outside the live stack", |out| {
                let _ = writeln!(out, "address {addr:#x}, live stack [{sp:#x}, {hi:#x})");
            });
        }
    }

    /// Function names of the live frames, innermost first.
    pub fn trace(&self) -> Vec<String> {
        let mut names = Vec::new();
        walk_frames(&self.rt().funcs, self.task().fp.load(Ordering::Relaxed), |_, info, _| {
            names.push(info.name.clone());
        });
        names
    }

    pub fn stack_size(&self) -> usize {
        self.task().stack_size()
    }

    /// Frames on the stack.
    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut fp = self.task().fp.load(Ordering::Relaxed);
        while fp != 0 {
            n += 1;
            fp = read(fp);
        }
        n
    }
}
