//! Blocking client for the cpacfstatsd socket.

use super::protocol::{write_frame, Answer, Frame, Query, MESSAGE_SIZE};
use crate::counters::{Command, Scope};
use crate::error::ProtocolError;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one query and collect the full response stream.
    pub fn query(&self, scope: Scope, command: Command) -> Result<Vec<Answer>, ProtocolError> {
        self.send_frame(&Query::new(scope, command).encode())
    }

    /// Send an already encoded frame. The daemon answers malformed frames by
    /// closing the connection, which shows up here as an empty stream.
    pub fn send_frame(&self, frame: &Frame) -> Result<Vec<Answer>, ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        write_frame(&mut stream, frame)?;

        let mut answers = Vec::new();
        while let Some(frame) = next_frame(&mut stream)? {
            answers.push(Answer::decode(&frame)?);
        }
        Ok(answers)
    }
}

/// Next frame, or `None` on a clean end of stream.
fn next_frame<R: Read>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut frame = [0u8; MESSAGE_SIZE];
    let mut filled = 0;

    while filled < MESSAGE_SIZE {
        match reader.read(&mut frame[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(frame))
}
