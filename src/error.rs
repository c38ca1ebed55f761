use thiserror::Error;

/// Errors raised while setting up or driving a subject process.
///
/// Every variant is fatal to the scenario that hit it. Nothing here is
/// retried; the orchestrator turns these into a failed verdict and moves on
/// to the next scenario.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The capture pipe could not be created because a descriptor limit
    /// was reached.
    #[error("Failed to create capture pipe, descriptor limit reached: {0}")]
    ResourceExhausted(nix::Error),

    /// The capture pipe could not be created for any other reason.
    #[error("Failed to create capture pipe: {0}")]
    Pipe(nix::Error),

    /// fork() failed.
    #[error("Failed to spawn subject process: {0}")]
    Spawn(nix::Error),

    /// Standard streams could not be rebound to the capture pipe.
    #[error("Failed to redirect standard streams: {0}")]
    Redirect(nix::Error),

    /// kill() on the subject failed.
    #[error("Failed to deliver {signal} to subject {pid}: {source}")]
    Delivery {
        pid: nix::unistd::Pid,
        signal: nix::sys::signal::Signal,
        source: nix::Error,
    },

    /// waitpid() on the subject failed.
    #[error("Failed to wait for subject {pid}: {source}")]
    Wait {
        pid: nix::unistd::Pid,
        source: nix::Error,
    },

    /// Reading the capture pipe failed.
    #[error("Failed to drain subject output: {0}")]
    Drain(#[from] std::io::Error),

    /// The subject closed its pipe or wrote something else before the
    /// readiness sentinel.
    #[error("Subject did not signal readiness (got {0:?})")]
    Handshake(Option<u8>),

    /// The failure signal handler could not be installed.
    #[error("Failed to install failure signal handler: {0}")]
    Install(nix::Error),

    /// A signal number or name that the OS does not know.
    #[error("Unknown signal: {0}")]
    UnknownSignal(String),
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, HarnessError>;
