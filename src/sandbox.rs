use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use parking_lot::{const_mutex, Mutex};
use tracing::{debug, info, warn};

use crate::capture::{self, CaptureReader, CapturedOutput};
use crate::catalog::FAILURE_SIGNALS;
use crate::error::{HarnessError, Result};

/// Exit code of a subject whose role returned instead of dying.
pub const EXIT_SURVIVED: i32 = 70;
/// Exit code of a subject whose role panicked.
pub const EXIT_PANICKED: i32 = 71;
/// Exit code of a subject that could not redirect its streams.
pub const EXIT_SETUP_FAILED: i32 = 72;

/// Held from pipe creation until the parent has closed its writer end.
///
/// Scenarios running on other threads would otherwise fork while a foreign
/// writer end is open and carry it into their subject, which delays the
/// foreign scenario's end-of-stream until that unrelated subject dies.
static SPAWN_LOCK: Mutex<()> = const_mutex(());

/// Configuration for subject processes
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// Leave RLIMIT_CORE alone in the subject
    pub keep_core_dumps: bool,
}

/// How a subject ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Killed by a signal
    Signaled { signal: Signal, core_dumped: bool },
    /// Called exit with a status code
    Exited(i32),
}

impl Termination {
    /// Returns the killing signal, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Termination::Signaled { signal, .. } => Some(*signal),
            Termination::Exited(_) => None,
        }
    }

    pub fn is_signaled_by(&self, expected: Signal) -> bool {
        self.signal() == Some(expected)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Signaled { signal, core_dumped: true } => {
                write!(f, "signaled by {} (core dumped)", signal.as_str())
            }
            Termination::Signaled { signal, .. } => write!(f, "signaled by {}", signal.as_str()),
            Termination::Exited(EXIT_SURVIVED) => write!(f, "exited with code {EXIT_SURVIVED} (role returned)"),
            Termination::Exited(EXIT_PANICKED) => write!(f, "exited with code {EXIT_PANICKED} (role panicked)"),
            Termination::Exited(EXIT_SETUP_FAILED) => {
                write!(f, "exited with code {EXIT_SETUP_FAILED} (stream redirect failed)")
            }
            Termination::Exited(code) => write!(f, "exited with code {code}"),
        }
    }
}

/// Lifecycle of a subject as seen from the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    /// Forked, possibly still running
    Running,
    /// Reaped; exit status is known
    Reaped,
}

/// Parent-side handle on one isolated subject process.
///
/// A subject is never reused: it is created by [`ProcessSandbox::spawn`] and
/// finished by [`ProcessSandbox::wait_for_exit`].
#[derive(Debug)]
pub struct Subject {
    pid: Pid,
    reader: Option<CaptureReader>,
    state: SubjectState,
    termination: Option<Termination>,
    output: Option<CapturedOutput>,
}

impl Subject {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> SubjectState {
        self.state
    }

    /// Exit status, known only after the subject was reaped.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Captured output, known only after draining.
    pub fn output(&self) -> Option<&CapturedOutput> {
        self.output.as_ref()
    }

    /// Blocks until the subject reports readiness over its capture pipe.
    pub fn await_ready(&mut self) -> Result<()> {
        match self.reader.as_mut() {
            Some(reader) => reader.await_ready(),
            None => Err(HarnessError::Handshake(None)),
        }
    }

    /// Drains the capture pipe to end-of-stream.
    ///
    /// Returns once the subject and every other holder of the writer end are
    /// gone. Draining twice returns the first capture.
    pub fn drain(&mut self) -> Result<&CapturedOutput> {
        if let Some(reader) = self.reader.take() {
            let output = reader.drain()?;
            debug!("drained {} bytes from subject {}", output.len(), self.pid);
            self.output = Some(output);
        }
        Ok(self.output.get_or_insert_with(CapturedOutput::default))
    }

    /// Consumes the subject once both exit status and output are final.
    pub fn into_parts(self) -> Option<(Termination, CapturedOutput)> {
        let mut subject = self;
        let termination = subject.termination.take()?;
        let output = subject.output.take()?;
        Some((termination, output))
    }
}

impl Drop for Subject {
    fn drop(&mut self) {
        // A subject abandoned before reaping must not be left sleeping.
        if self.state == SubjectState::Running {
            warn!("Subject {} dropped before reaping, killing it", self.pid);
            match kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to SIGKILL subject {}: {}", self.pid, e),
            }
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Puts every failure signal back to its default action.
///
/// A forked subject inherits the parent's dispositions, including the Rust
/// runtime's SIGSEGV/SIGBUS stack-overflow handler, which returns from a
/// raised SIGSEGV instead of ending the process.
fn reset_failure_dispositions() {
    for failure_signal in FAILURE_SIGNALS {
        // SAFETY: installing SIG_DFL never runs user code.
        let _ = unsafe { nix::sys::signal::signal(failure_signal, SigHandler::SigDfl) };
    }
}

/// Spawns subjects in their own processes and controls them from outside.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Forks a subject that runs `role` with its stdout and stderr bound to a
    /// fresh capture pipe.
    ///
    /// `role` is expected to end the process, typically by a fatal signal.
    /// If it returns the subject exits with [`EXIT_SURVIVED`]; if it panics,
    /// with [`EXIT_PANICKED`]. In either case control never returns to the
    /// caller's code inside the subject.
    pub fn spawn<F>(&self, role: F) -> Result<Subject>
    where
        F: FnOnce(),
    {
        let _spawn_guard = SPAWN_LOCK.lock();
        let (writer, reader) = capture::open()?;

        // SAFETY: the child only rebinds descriptors, resets signal
        // dispositions, adjusts a resource limit and runs `role` before calling _exit; it never returns into
        // the caller's stack frames.
        match unsafe { fork() }.map_err(HarnessError::Spawn)? {
            ForkResult::Child => {
                drop(reader);
                if writer.redirect_process_streams().is_err() {
                    unsafe { libc::_exit(EXIT_SETUP_FAILED) };
                }
                drop(writer);
                reset_failure_dispositions();
                if !self.config.keep_core_dumps {
                    let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
                }

                let code = match catch_unwind(AssertUnwindSafe(role)) {
                    Ok(()) => EXIT_SURVIVED,
                    Err(_) => EXIT_PANICKED,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                // End-of-stream is only observable once this copy is closed.
                drop(writer);
                info!("Subject spawned with PID: {}", child);
                Ok(Subject {
                    pid: child,
                    reader: Some(reader),
                    state: SubjectState::Running,
                    termination: None,
                    output: None,
                })
            }
        }
    }

    /// Sends `signal` to the subject from outside.
    ///
    /// A subject that already exited but was not yet reaped is a zombie and
    /// still accepts the signal; any error, `ESRCH` included, is reported as
    /// [`HarnessError::Delivery`].
    pub fn deliver_signal(&self, subject: &Subject, signal: Signal) -> Result<()> {
        debug!("Sending {} to subject {}", signal.as_str(), subject.pid);
        kill(subject.pid, signal).map_err(|source| HarnessError::Delivery {
            pid: subject.pid,
            signal,
            source,
        })
    }

    /// Blocks until the subject terminates and records how it ended.
    ///
    /// Waiting on an already reaped subject returns the recorded status.
    pub fn wait_for_exit(&self, subject: &mut Subject) -> Result<Termination> {
        if let Some(termination) = subject.termination {
            return Ok(termination);
        }

        let termination = loop {
            match waitpid(subject.pid, None) {
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => {
                    break Termination::Signaled { signal, core_dumped };
                }
                Ok(WaitStatus::Exited(_, code)) => break Termination::Exited(code),
                Ok(other) => debug!("Ignoring wait status {:?} for subject {}", other, subject.pid),
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    subject.state = SubjectState::Reaped;
                    return Err(HarnessError::Wait {
                        pid: subject.pid,
                        source,
                    });
                }
            }
        };

        subject.state = SubjectState::Reaped;
        subject.termination = Some(termination);
        info!("Subject {} {}", subject.pid, termination);
        Ok(termination)
    }
}
