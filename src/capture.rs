//! Byte pipe that carries a subject's standard streams back to the parent.
//!
//! The writer end is consumed on the subject side by
//! [`CaptureWriter::redirect_process_streams`]; the reader end stays with the
//! parent, which drains it until every writer has gone away.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd::{dup2_stderr, dup2_stdout, pipe, write};
use tracing::trace;

use crate::error::{HarnessError, Result};

/// Chunk size for each read of the capture pipe.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Byte a subject writes once its handler is installed when the parent
/// paces delivery with a readiness handshake.
pub const READY_SENTINEL: u8 = 0x06;

/// Writer end of the capture pipe.
#[derive(Debug)]
pub struct CaptureWriter(OwnedFd);

/// Reader end of the capture pipe.
#[derive(Debug)]
pub struct CaptureReader {
    file: File,
    // Bytes read while waiting for the sentinel that belong to the output.
    pending: Vec<u8>,
}

/// Creates the capture pipe.
pub fn open() -> Result<(CaptureWriter, CaptureReader)> {
    let (read_end, write_end) = pipe().map_err(|err| match err {
        Errno::EMFILE | Errno::ENFILE => HarnessError::ResourceExhausted(err),
        other => HarnessError::Pipe(other),
    })?;
    Ok((
        CaptureWriter(write_end),
        CaptureReader {
            file: File::from(read_end),
            pending: Vec::new(),
        },
    ))
}

impl CaptureWriter {
    /// Rebinds the calling process's stdout and stderr to this pipe.
    ///
    /// Everything the process writes to either stream afterwards, the
    /// failure report included, reaches only the reader end.
    pub fn redirect_process_streams(&self) -> Result<()> {
        dup2_stdout(&self.0).map_err(HarnessError::Redirect)?;
        dup2_stderr(&self.0).map_err(HarnessError::Redirect)?;
        Ok(())
    }
}

impl AsFd for CaptureWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Writes the readiness sentinel to the process's (redirected) stdout.
pub fn signal_ready() -> Result<()> {
    write(std::io::stdout(), &[READY_SENTINEL]).map_err(HarnessError::Redirect)?;
    Ok(())
}

impl CaptureReader {
    /// Blocks until the subject writes the readiness sentinel.
    ///
    /// The sentinel is consumed and does not appear in the drained output.
    /// Any other byte fails the handshake but is kept for [`drain`].
    ///
    /// [`drain`]: CaptureReader::drain
    pub fn await_ready(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => return Err(HarnessError::Handshake(None)),
                Ok(_) if byte[0] == READY_SENTINEL => return Ok(()),
                Ok(_) => {
                    self.pending.push(byte[0]);
                    return Err(HarnessError::Handshake(Some(byte[0])));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Reads until end-of-stream.
    ///
    /// Only returns once every writer end is closed, so the caller must have
    /// dropped its own [`CaptureWriter`] first.
    pub fn drain(mut self) -> Result<CapturedOutput> {
        let mut output = std::mem::take(&mut self.pending);
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.file.read(&mut buffer) {
                Ok(0) => break,
                Ok(read_length) => {
                    trace!("captured {} bytes", read_length);
                    output.extend_from_slice(&buffer[..read_length]);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(CapturedOutput(output))
    }
}

/// Everything a subject wrote before and during its death.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput(Vec<u8>);

impl CapturedOutput {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<Vec<u8>> for CapturedOutput {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for CapturedOutput {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}
