//! Live capture of another thread's stack
//!
//! ## Suspension protocol (Linux)
//!
//! The sampler signals the target with `SIGPROF`. The handler, running on the
//! target, publishes its interrupted registers and spins until released, so
//! the target is parked inside its own signal handler while the sampler walks
//! its frame-pointer chain.
//!
//! ```text
//!  sampler                       target (in SIGPROF handler)
//!  ───────                       ──────
//!  IDLE ─CAS─▶ SIGNALLED
//!  tgkill(tid, SIGPROF)  ──────▶ check state + tid
//!                                store pc/fp/sp
//!  wait READY            ◀────── READY, spin
//!  walk frames (no alloc)
//!  drop guard: RELEASED  ──────▶ RESUMED, return
//!  wait RESUMED, IDLE
//! ```
//!
//! Nothing is allocated and no lock is taken between `SIGNALLED` and
//! `RESUMED`: the target may itself hold the allocator lock. Frame memory is
//! read with `process_vm_readv`, so a corrupt chain ends the walk instead of
//! faulting. Installing the handler replaces any existing `SIGPROF` handler.

use std::mem::size_of;

use crate::domain::{CaptureError, Tid, WalkAbort};

use super::captured::{clamp_depth, CapturedStack, StackFrame};
use super::cursor::StackCursor;
use super::self_thread::capture_current_thread;

/// Registers of an interrupted thread needed for a frame-pointer walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: usize,
    pub fp: usize,
    pub sp: usize,
}

/// Fault-tolerant read of one frame record (`[saved fp, return address]`)
pub trait FrameReader {
    /// Returns `(saved_frame_pointer, return_address)`, or `None` if the
    /// memory at `frame_pointer` cannot be read
    fn read_frame_record(&self, frame_pointer: usize) -> Option<(usize, usize)>;
}

/// Reads frame records from this process's memory
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

#[cfg(target_os = "linux")]
impl FrameReader for ProcessMemory {
    #[allow(unsafe_code)]
    fn read_frame_record(&self, frame_pointer: usize) -> Option<(usize, usize)> {
        let mut record = [0usize; 2];
        let len = size_of::<[usize; 2]>();
        let local = libc::iovec { iov_base: record.as_mut_ptr().cast(), iov_len: len };
        let remote = libc::iovec { iov_base: frame_pointer as *mut libc::c_void, iov_len: len };
        // SAFETY: the kernel validates the remote range and fails with EFAULT
        // instead of faulting; the local buffer is ours and sized `len`
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        (usize::try_from(read).ok() == Some(len)).then_some((record[0], record[1]))
    }
}

#[cfg(not(target_os = "linux"))]
impl FrameReader for ProcessMemory {
    fn read_frame_record(&self, _frame_pointer: usize) -> Option<(usize, usize)> {
        None
    }
}

/// Walks the frame-pointer chain of a suspended thread.
///
/// The first frame is the interrupted program counter; each following frame is
/// a saved return address. Frame pointers must be aligned and strictly
/// increasing, otherwise the chain counts as broken.
pub struct LiveThreadCursor<R: FrameReader = ProcessMemory> {
    registers: Registers,
    reader: R,
    max_depth: usize,
    depth: usize,
    next_fp: usize,
    lower_bound: usize,
    current: Option<StackFrame>,
    abort: Option<WalkAbort>,
    finished: bool,
}

impl LiveThreadCursor<ProcessMemory> {
    #[must_use]
    pub fn new(registers: Registers, max_depth: usize) -> Self {
        Self::with_reader(registers, max_depth, ProcessMemory)
    }
}

impl<R: FrameReader> LiveThreadCursor<R> {
    #[must_use]
    pub fn with_reader(registers: Registers, max_depth: usize, reader: R) -> Self {
        Self {
            registers,
            reader,
            max_depth: clamp_depth(max_depth),
            depth: 0,
            next_fp: registers.fp,
            lower_bound: registers.sp,
            current: None,
            abort: None,
            finished: false,
        }
    }

    fn finish(&mut self, abort: Option<WalkAbort>) -> bool {
        self.finished = true;
        self.current = None;
        self.abort = abort;
        false
    }

    fn set_current(&mut self, address: usize) {
        match self.current.as_mut() {
            Some(frame) => frame.reset_to(address),
            None => self.current = Some(StackFrame::new(address)),
        }
    }
}

impl<R: FrameReader> StackCursor for LiveThreadCursor<R> {
    fn advance(&mut self) -> bool {
        if self.finished {
            return false;
        }
        if self.depth == 0 {
            if self.registers.pc == 0 {
                return self.finish(None);
            }
            self.depth = 1;
            self.set_current(self.registers.pc);
            return true;
        }

        let fp = self.next_fp;
        // A null frame pointer is the normal bottom of the chain
        if fp == 0 {
            return self.finish(None);
        }
        let broken = WalkAbort::BrokenChain { depth: self.depth, frame_pointer: fp };
        if fp % size_of::<usize>() != 0 || fp < self.lower_bound {
            return self.finish(Some(broken));
        }
        let Some((saved_fp, return_address)) = self.reader.read_frame_record(fp) else {
            return self.finish(Some(broken));
        };
        if return_address == 0 {
            return self.finish(None);
        }
        // Only a real frame beyond the ceiling makes the walk incomplete
        if self.depth >= self.max_depth {
            return self.finish(Some(WalkAbort::DepthCeiling(self.max_depth)));
        }

        self.lower_bound = fp + 1;
        self.next_fp = saved_fp;
        self.depth += 1;
        self.set_current(return_address);
        true
    }

    fn frame(&self) -> Option<&StackFrame> {
        self.current.as_ref()
    }

    fn frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.current.as_mut()
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn leading_pc(&self) -> bool {
        true
    }

    fn abort_reason(&self) -> Option<WalkAbort> {
        self.abort
    }

    fn reset(&mut self) {
        self.depth = 0;
        self.next_fp = self.registers.fp;
        self.lower_bound = self.registers.sp;
        self.current = None;
        self.abort = None;
        self.finished = false;
    }
}

/// Capture the stack of thread `tid` of this process.
///
/// The target is suspended only for the duration of the frame walk and is
/// resumed on every exit path. Capturing the calling thread falls back to
/// [`capture_current_thread`].
///
/// # Errors
/// Returns [`CaptureError`] if the stack buffer cannot be reserved or the
/// thread cannot be suspended; the sample is then dropped.
pub fn capture_thread(tid: Tid, max_depth: usize) -> Result<CapturedStack, CaptureError> {
    if tid == crate::process::current_tid() {
        return Ok(capture_current_thread(0, max_depth));
    }
    let max_depth = clamp_depth(max_depth);
    let mut addresses = Vec::new();
    addresses.try_reserve_exact(max_depth)?;

    let abort = {
        let guard = suspend::SuspendGuard::acquire(tid, suspend::SUSPEND_TIMEOUT)?;
        let mut cursor = LiveThreadCursor::new(guard.registers(), max_depth);
        while cursor.advance() {
            if let Some(frame) = cursor.frame() {
                addresses.push(frame.address);
            }
        }
        cursor.abort_reason()
    };

    Ok(CapturedStack::from_walk(addresses, true, abort))
}

pub use suspend::SuspendGuard;

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod suspend {
    use std::io;
    use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};

    use super::Registers;
    use crate::domain::{CaptureError, Tid};

    pub(super) const SUSPEND_TIMEOUT: Duration = Duration::from_millis(100);

    /// Longest a target stays parked if the sampler never releases it
    const HANDLER_HOLD_LIMIT: Duration = Duration::from_secs(1);

    const IDLE: u8 = 0;
    const SIGNALLED: u8 = 1;
    const READY: u8 = 2;
    const RELEASED: u8 = 3;
    const RESUMED: u8 = 4;

    static STATE: AtomicU8 = AtomicU8::new(IDLE);
    static TARGET: AtomicI32 = AtomicI32::new(0);
    static PC: AtomicUsize = AtomicUsize::new(0);
    static FP: AtomicUsize = AtomicUsize::new(0);
    static SP: AtomicUsize = AtomicUsize::new(0);

    /// `None` once installed, `Some(errno)` if `sigaction` failed
    static HANDLER: OnceLock<Option<i32>> = OnceLock::new();

    /// A foreign thread parked in the sampling signal handler.
    ///
    /// Dropping the guard resumes the thread.
    pub struct SuspendGuard {
        tid: Tid,
        registers: Registers,
    }

    impl SuspendGuard {
        /// Suspend `tid` and read its registers.
        ///
        /// # Errors
        /// Fails if the handler cannot be installed, another capture holds the
        /// sampler past `timeout`, the signal cannot be sent, or the target
        /// does not acknowledge within `timeout`.
        pub fn acquire(tid: Tid, timeout: Duration) -> Result<Self, CaptureError> {
            install_handler()?;

            let start = Instant::now();
            while STATE.compare_exchange(IDLE, SIGNALLED, Ordering::AcqRel, Ordering::Acquire).is_err()
            {
                if start.elapsed() > timeout {
                    return Err(CaptureError::SamplerBusy);
                }
                std::thread::yield_now();
            }
            TARGET.store(i32::from(tid), Ordering::Release);

            if let Err(source) = tgkill(tid) {
                STATE.store(IDLE, Ordering::Release);
                return Err(CaptureError::SignalFailed { tid, source });
            }

            while STATE.load(Ordering::Acquire) != READY {
                if start.elapsed() > timeout {
                    // The handler may still win the race to READY
                    if STATE
                        .compare_exchange(SIGNALLED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Err(CaptureError::SuspendTimeout(tid));
                    }
                    break;
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            }

            let registers = Registers {
                pc: PC.load(Ordering::Acquire),
                fp: FP.load(Ordering::Acquire),
                sp: SP.load(Ordering::Acquire),
            };
            Ok(Self { tid, registers })
        }

        #[must_use]
        pub fn registers(&self) -> Registers {
            self.registers
        }

        #[must_use]
        pub fn tid(&self) -> Tid {
            self.tid
        }
    }

    impl Drop for SuspendGuard {
        fn drop(&mut self) {
            // Otherwise the handler gave up waiting and already reset the state
            if STATE.compare_exchange(READY, RELEASED, Ordering::AcqRel, Ordering::Acquire).is_ok()
            {
                let start = Instant::now();
                while STATE.load(Ordering::Acquire) != RESUMED
                    && start.elapsed() < SUSPEND_TIMEOUT
                {
                    std::thread::yield_now();
                }
                STATE.store(IDLE, Ordering::Release);
            }
        }
    }

    #[allow(unsafe_code)]
    fn install_handler() -> Result<(), CaptureError> {
        let failed = HANDLER.get_or_init(|| {
            // SAFETY: sigaction is plain old data; the handler only touches
            // atomics and async-signal-safe syscalls
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_sample_signal as *const () as libc::sighandler_t;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()) == 0 {
                    log::debug!("Installed SIGPROF sampling handler");
                    None
                } else {
                    Some(io::Error::last_os_error().raw_os_error().unwrap_or(0))
                }
            }
        });
        match failed {
            None => Ok(()),
            Some(errno) => Err(CaptureError::HandlerInstall(io::Error::from_raw_os_error(*errno))),
        }
    }

    #[allow(unsafe_code)]
    fn tgkill(tid: Tid) -> io::Result<()> {
        // SAFETY: plain syscall, no memory is passed
        let rc = unsafe {
            libc::syscall(libc::SYS_tgkill, libc::getpid(), i32::from(tid), libc::SIGPROF)
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    extern "C" fn on_sample_signal(
        _signal: libc::c_int,
        _info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        if STATE.load(Ordering::Acquire) != SIGNALLED {
            return;
        }
        // SAFETY: gettid is async-signal-safe
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
        if tid != TARGET.load(Ordering::Acquire) {
            return;
        }

        // SAFETY: errno location is thread-local and always valid
        let saved_errno = unsafe { *libc::__errno_location() };

        // SAFETY: the kernel passes a valid ucontext_t for SA_SIGINFO handlers
        let registers = unsafe { registers_from_context(context) };
        PC.store(registers.pc, Ordering::Relaxed);
        FP.store(registers.fp, Ordering::Relaxed);
        SP.store(registers.sp, Ordering::Relaxed);
        // The sampler may have timed out in the meantime
        if STATE.compare_exchange(SIGNALLED, READY, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let parked = Instant::now();
            while STATE.load(Ordering::Acquire) == READY && parked.elapsed() < HANDLER_HOLD_LIMIT
            {
                std::hint::spin_loop();
                // SAFETY: sched_yield is async-signal-safe
                unsafe { libc::sched_yield() };
            }
            if STATE.compare_exchange(RELEASED, RESUMED, Ordering::AcqRel, Ordering::Acquire).is_err()
            {
                // Never released: hand the sampler slot back ourselves
                let _ = STATE.compare_exchange(READY, IDLE, Ordering::AcqRel, Ordering::Acquire);
            }
        }

        // SAFETY: see above
        unsafe { *libc::__errno_location() = saved_errno };
    }

    #[cfg(target_arch = "x86_64")]
    #[allow(unsafe_code, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    unsafe fn registers_from_context(context: *mut libc::c_void) -> Registers {
        let uc = &*(context as *const libc::ucontext_t);
        let gregs = &uc.uc_mcontext.gregs;
        Registers {
            pc: gregs[libc::REG_RIP as usize] as usize,
            fp: gregs[libc::REG_RBP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    unsafe fn registers_from_context(context: *mut libc::c_void) -> Registers {
        let uc = &*(context as *const libc::ucontext_t);
        let mc = &uc.uc_mcontext;
        Registers { pc: mc.pc as usize, fp: mc.regs[29] as usize, sp: mc.sp as usize }
    }
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod suspend {
    use std::time::Duration;

    use super::Registers;
    use crate::domain::{CaptureError, Tid};

    pub(super) const SUSPEND_TIMEOUT: Duration = Duration::from_millis(100);

    /// Live suspension is unavailable on this platform; acquiring always fails.
    pub struct SuspendGuard {
        registers: Registers,
    }

    impl SuspendGuard {
        /// # Errors
        /// Always returns [`CaptureError::Unsupported`]
        pub fn acquire(_tid: Tid, _timeout: Duration) -> Result<Self, CaptureError> {
            Err(CaptureError::Unsupported)
        }

        #[must_use]
        pub fn registers(&self) -> Registers {
            self.registers
        }
    }
}
