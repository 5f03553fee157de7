//! Wire protocol between cpacfstatsd and its clients
//!
//! Every message is one fixed-size frame: a header (protocol version and
//! message type) followed by a Query or Answer body, padded to the size of the
//! larger body. Fields use native byte order since both ends are on the same
//! host.
//!
//! ```text
//! offset  0        4        8         12            16                24
//!         +--------+--------+---------+-------------+-----------------+
//! Query   | ver    | type=1 | counter | command     | zero            |
//! Answer  | ver    | type=2 | counter | state/error | value (u64)     |
//!         +--------+--------+---------+-------------+-----------------+
//! ```

use crate::counters::{Command, CounterId, CounterState, Scope};
use crate::error::{BackendError, ProtocolError};
use std::io::{Read, Write};

/// Protocol version compiled into the daemon; peers must match exactly.
pub const PROTOCOL_VERSION: u32 = 2;

/// Size in bytes of every message on the wire
pub const MESSAGE_SIZE: usize = 24;

pub type Frame = [u8; MESSAGE_SIZE];

/// Message type carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Query = 1,
    Answer = 2,
}

/// Common message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub message_type: u32,
}

impl Header {
    fn new(message_type: MessageType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: message_type as u32,
        }
    }

    fn encode_into(&self, frame: &mut Frame) {
        frame[0..4].copy_from_slice(&self.version.to_ne_bytes());
        frame[4..8].copy_from_slice(&self.message_type.to_ne_bytes());
    }

    fn decode(frame: &Frame) -> Self {
        Self {
            version: u32_at(frame, 0),
            message_type: u32_at(frame, 4),
        }
    }

    /// Hard checks every received message goes through before its body is
    /// looked at.
    fn expect(&self, message_type: MessageType) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::ProtocolMismatch {
                found: self.version,
                expected: PROTOCOL_VERSION,
            });
        }
        if self.message_type != message_type as u32 {
            return Err(ProtocolError::UnexpectedType {
                found: self.message_type,
                expected: message_type as u32,
            });
        }
        Ok(())
    }
}

/// Client request: one command applied to one counter or to all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub scope: Scope,
    pub command: Command,
}

impl Query {
    pub fn new(scope: Scope, command: Command) -> Self {
        Self { scope, command }
    }

    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; MESSAGE_SIZE];
        Header::new(MessageType::Query).encode_into(&mut frame);
        frame[8..12].copy_from_slice(&self.scope.to_wire().to_ne_bytes());
        frame[12..16].copy_from_slice(&self.command.to_wire().to_ne_bytes());
        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        Header::decode(frame).expect(MessageType::Query)?;

        let counter = u32_at(frame, 8);
        let scope = Scope::from_wire(counter).ok_or(ProtocolError::UnknownCounter(counter))?;
        let command = u32_at(frame, 12);
        let command = Command::from_wire(command).ok_or(ProtocolError::UnknownCommand(command))?;

        Ok(Self { scope, command })
    }
}

/// One element of a response stream
///
/// `counter` is a counter wire value, or a 0-based sub-counter index for the
/// answers that follow an enabled composite counter. `status` is either a
/// [`CounterState`] wire value or a negative backend error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub counter: u32,
    pub status: i32,
    pub value: u64,
}

impl Answer {
    pub fn counter(id: CounterId, state: CounterState, value: u64) -> Self {
        Self {
            counter: id.to_wire(),
            status: state.to_wire(),
            value,
        }
    }

    pub fn subcounter(index: usize, value: u64) -> Self {
        Self {
            counter: index as u32,
            status: CounterState::Enabled.to_wire(),
            value,
        }
    }

    /// Error answer for a counter wire value or sub-counter index.
    pub fn failure(counter: u32, error: BackendError) -> Self {
        Self {
            counter,
            status: error.code(),
            value: 0,
        }
    }

    /// Trailing hotplug status: status 0 and the flag on success.
    pub fn hotplug(result: Result<u64, BackendError>) -> Self {
        let (status, value) = match result {
            Ok(value) => (0, value),
            Err(e) => (e.code(), 0),
        };
        Self {
            counter: CounterId::HotplugDetected.to_wire(),
            status,
            value,
        }
    }

    /// Lifecycle state carried by this answer, if it is not an error.
    pub fn state(&self) -> Option<CounterState> {
        CounterState::from_wire(self.status)
    }

    pub fn error_code(&self) -> Option<i32> {
        (self.status < 0).then_some(self.status)
    }

    pub fn encode(&self) -> Frame {
        let mut frame = [0u8; MESSAGE_SIZE];
        Header::new(MessageType::Answer).encode_into(&mut frame);
        frame[8..12].copy_from_slice(&self.counter.to_ne_bytes());
        frame[12..16].copy_from_slice(&self.status.to_ne_bytes());
        frame[16..24].copy_from_slice(&self.value.to_ne_bytes());
        frame
    }

    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        Header::decode(frame).expect(MessageType::Answer)?;

        Ok(Self {
            counter: u32_at(frame, 8),
            status: i32::from_ne_bytes(bytes_at(frame, 12)),
            value: u64::from_ne_bytes(bytes_at(frame, 16)),
        })
    }
}

/// Read exactly one frame.
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Frame> {
    let mut frame = [0u8; MESSAGE_SIZE];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

fn bytes_at<const N: usize>(frame: &Frame, offset: usize) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(&frame[offset..offset + N]);
    bytes
}

fn u32_at(frame: &Frame, offset: usize) -> u32 {
    u32::from_ne_bytes(bytes_at(frame, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_layout() {
        let frame = Query::new(Scope::All, Command::Print).encode();

        assert_eq!(u32_at(&frame, 0), PROTOCOL_VERSION);
        assert_eq!(u32_at(&frame, 4), MessageType::Query as u32);
        assert_eq!(u32_at(&frame, 8), 5);
        assert_eq!(u32_at(&frame, 12), 3);
        assert!(frame[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_query_decode() {
        let query = Query::new(Scope::One(CounterId::PaiKernel), Command::Reset);
        assert_eq!(Query::decode(&query.encode()).unwrap(), query);
    }

    #[test]
    fn test_query_wrong_version() {
        let mut frame = Query::new(Scope::All, Command::Enable).encode();
        frame[0..4].copy_from_slice(&(PROTOCOL_VERSION + 1).to_ne_bytes());

        match Query::decode(&frame) {
            Err(ProtocolError::ProtocolMismatch { found, expected }) => {
                assert_eq!(found, PROTOCOL_VERSION + 1);
                assert_eq!(expected, PROTOCOL_VERSION);
            }
            other => panic!("Expected ProtocolMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_query_wrong_type() {
        let frame = Answer::counter(CounterId::Aes, CounterState::Enabled, 1).encode();
        assert!(matches!(
            Query::decode(&frame),
            Err(ProtocolError::UnexpectedType {
                found: 2,
                expected: 1
            })
        ));
    }

    #[test]
    fn test_query_unknown_fields() {
        let mut frame = Query::new(Scope::All, Command::Print).encode();
        frame[8..12].copy_from_slice(&8u32.to_ne_bytes());
        assert!(matches!(
            Query::decode(&frame),
            Err(ProtocolError::UnknownCounter(8))
        ));

        let mut frame = Query::new(Scope::All, Command::Print).encode();
        frame[12..16].copy_from_slice(&17u32.to_ne_bytes());
        assert!(matches!(
            Query::decode(&frame),
            Err(ProtocolError::UnknownCommand(17))
        ));
    }

    #[test]
    fn test_answer_layout() {
        let answer = Answer::failure(2, BackendError::from_errno(libc::EIO));
        let frame = answer.encode();

        assert_eq!(u32_at(&frame, 4), MessageType::Answer as u32);
        assert_eq!(u32_at(&frame, 8), 2);
        assert_eq!(i32::from_ne_bytes(bytes_at(&frame, 12)), -libc::EIO);
        assert_eq!(u64::from_ne_bytes(bytes_at(&frame, 16)), 0);
        assert_eq!(Answer::decode(&frame).unwrap(), answer);
    }

    #[test]
    fn test_answer_accessors() {
        let answer = Answer::counter(CounterId::Sha, CounterState::Enabled, u64::MAX);
        assert_eq!(answer.state(), Some(CounterState::Enabled));
        assert_eq!(answer.error_code(), None);

        let answer = Answer::failure(6, BackendError::interrupted());
        assert_eq!(answer.state(), None);
        assert_eq!(answer.error_code(), Some(-libc::EINTR));

        let answer = Answer::hotplug(Ok(1));
        assert_eq!(answer.counter, 8);
        assert_eq!(answer.status, 0);
        assert_eq!(answer.value, 1);
    }

    #[test]
    fn test_frame_io() {
        let answer = Answer::subcounter(3, 42);
        let mut buf = Vec::new();
        write_frame(&mut buf, &answer.encode()).unwrap();
        assert_eq!(buf.len(), MESSAGE_SIZE);

        let frame = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(Answer::decode(&frame).unwrap(), answer);
        assert!(read_frame(&mut &buf[..10]).is_err());
    }
}
