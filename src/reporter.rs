//! Failure signal handler checked by the harness.
//!
//! [`install`] registers a handler for every signal in
//! [`FAILURE_SIGNALS`](crate::catalog::FAILURE_SIGNALS). On delivery the
//! handler writes a report to fd 2 and then lets the signal's default
//! disposition kill the process:
//!
//! ```text
//! *** SIG_ABORT received at time=1561409570 ***
//!     @ 0x000055c3ddb5d93c  crashprobe::reporter::on_failure_signal
//!     @ 0x00007faef9f283a0  (unknown)
//! ```
//!
//! The header is formatted into a fixed stack buffer and written with a raw
//! `write(2)`. Symbolizing frames allocates and is therefore not
//! async-signal-safe; it can be turned off with
//! [`HandlerOptions::symbolize_stacktrace`].

use std::fmt::{self, Write as _};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use libc::{c_int, c_void, siginfo_t};
use nix::errno::Errno;
use nix::sys::signal::{raise, sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::catalog::{self, FAILURE_SIGNALS};
use crate::error::{HarnessError, Result};

/// Deepest stack the report walks.
pub const MAX_FRAMES: usize = 128;

const ALTERNATE_STACK_SIZE: usize = 256 * 1024;
const LINE_CAPACITY: usize = 512;

/// Options accepted by [`install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Resolve frame addresses to symbol names in the report.
    pub symbolize_stacktrace: bool,
    /// Run the handler on a dedicated signal stack so stack overflows can
    /// still be reported.
    pub use_alternate_stack: bool,
    /// After reporting, also invoke whatever handler was installed before.
    pub call_previous_handler: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            symbolize_stacktrace: true,
            use_alternate_stack: true,
            call_previous_handler: false,
        }
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static SYMBOLIZE: AtomicBool = AtomicBool::new(true);
static CALL_PREVIOUS: AtomicBool = AtomicBool::new(false);
static REPORTING: AtomicBool = AtomicBool::new(false);

/// Dispositions that were in place before the first install, indexed like
/// `FAILURE_SIGNALS`.
static PREVIOUS: [OnceLock<SigAction>; FAILURE_SIGNALS.len()] = [const { OnceLock::new() }; FAILURE_SIGNALS.len()];

/// Installs the failure handler for every catalogued signal.
///
/// Calling it again only refreshes the options: the dispositions recorded
/// by the first call are kept, so the previous handler never ends up being
/// this one.
pub fn install(options: &HandlerOptions) -> Result<()> {
    SYMBOLIZE.store(options.symbolize_stacktrace, Ordering::SeqCst);
    CALL_PREVIOUS.store(options.call_previous_handler, Ordering::SeqCst);

    let mut flags = SaFlags::SA_SIGINFO;
    if options.use_alternate_stack {
        install_alternate_stack()?;
        flags |= SaFlags::SA_ONSTACK;
    }

    let handler = SigHandler::SigAction(on_failure_signal);
    let action = SigAction::new(handler, flags, SigSet::empty());
    for (slot, failure_signal) in PREVIOUS.iter().zip(FAILURE_SIGNALS) {
        // SAFETY: the handler only touches atomics, fd 2 and the recorded
        // dispositions before re-raising.
        let previous = unsafe { sigaction(failure_signal, &action) }.map_err(HarnessError::Install)?;
        if previous.handler() != handler {
            let _ = slot.set(previous);
        }
    }

    INSTALLED.store(true, Ordering::SeqCst);
    Ok(())
}

/// Whether [`install`] has succeeded in this process.
pub fn installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Gives the calling thread a signal stack of at least
/// `ALTERNATE_STACK_SIZE` bytes. The runtime's own guard-page stack is far
/// too small for symbolization, so it gets replaced.
fn install_alternate_stack() -> Result<()> {
    // SAFETY: the new stack is leaked and stays valid for the life of the
    // process.
    unsafe {
        let mut current: libc::stack_t = std::mem::zeroed();
        if libc::sigaltstack(std::ptr::null(), &mut current) != 0 {
            return Err(HarnessError::Install(Errno::last()));
        }
        if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALTERNATE_STACK_SIZE {
            return Ok(());
        }

        let stack: &'static mut [u8] = Box::leak(vec![0u8; ALTERNATE_STACK_SIZE].into_boxed_slice());
        let mut replacement: libc::stack_t = std::mem::zeroed();
        replacement.ss_sp = stack.as_mut_ptr().cast();
        replacement.ss_size = stack.len();
        replacement.ss_flags = 0;
        if libc::sigaltstack(&replacement, std::ptr::null_mut()) != 0 {
            return Err(HarnessError::Install(Errno::last()));
        }
    }
    Ok(())
}

extern "C" fn on_failure_signal(signo: c_int, info: *mut siginfo_t, context: *mut c_void) {
    // A fault while reporting lands here again; skip straight to dying.
    if !REPORTING.swap(true, Ordering::SeqCst) {
        let mut line = ReportLine::new();
        write_header(&mut line, signo, unix_time());
        line.emit();
        write_stack(&mut line, SYMBOLIZE.load(Ordering::SeqCst));
    }

    if CALL_PREVIOUS.load(Ordering::SeqCst) {
        call_previous(signo, info, context);
    }

    raise_to_default(signo);
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn write_header(line: &mut ReportLine, signo: c_int, time: u64) {
    let _ = match catalog::name_of(signo) {
        "" => writeln!(line, "*** {signo} received at time={time} ***"),
        name => writeln!(line, "*** {name} received at time={time} ***"),
    };
}

fn write_stack(line: &mut ReportLine, symbolize: bool) {
    let mut depth = 0;
    // SAFETY: the process is about to die; nothing else unwinds or resolves
    // symbols concurrently in a subject.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let _ = write!(line, "    @ {:#018x}", frame.ip() as usize);
            if symbolize {
                let mut named = false;
                backtrace::resolve_frame_unsynchronized(frame, |symbol| {
                    if let Some(name) = symbol.name() {
                        if named {
                            let _ = line.write_str("\n");
                            line.emit();
                            let _ = write!(line, "      (inlined)         {name:#}");
                        } else {
                            let _ = write!(line, "  {name:#}");
                            named = true;
                        }
                    }
                });
                if !named {
                    let _ = line.write_str("  (unknown)");
                }
            }
            let _ = line.write_str("\n");
            line.emit();

            depth += 1;
            depth < MAX_FRAMES
        });
    }
}

fn call_previous(signo: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let Some(index) = FAILURE_SIGNALS.iter().position(|s| *s as c_int == signo) else {
        return;
    };
    match PREVIOUS[index].get().map(SigAction::handler) {
        Some(SigHandler::Handler(previous)) => previous(signo),
        Some(SigHandler::SigAction(previous)) => previous(signo, info, context),
        _ => {}
    }
}

fn raise_to_default(signo: c_int) {
    if let Ok(failure_signal) = Signal::try_from(signo) {
        // SAFETY: restoring the default disposition is always sound.
        unsafe {
            let _ = signal(failure_signal, SigHandler::SigDfl);
        }
        let _ = raise(failure_signal);
    }
}

/// One report line, formatted without touching the heap. Text past the
/// capacity is dropped.
struct ReportLine {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl ReportLine {
    fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    #[cfg(test)]
    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Writes the buffered line to fd 2 and clears it.
    fn emit(&mut self) {
        // SAFETY: fd 2 stays open for the life of the process.
        let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
        let mut written = 0;
        while written < self.len {
            match nix::unistd::write(stderr, &self.buf[written..self.len]) {
                Ok(0) => break,
                Ok(count) => written += count,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        self.len = 0;
    }
}

impl fmt::Write for ReportLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
