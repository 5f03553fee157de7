//! Command dispatch and response streaming.
//!
//! A query touches every in-scope counter once, in enumeration order, and
//! streams one answer per counter (plus one per sub-counter of an enabled
//! composite). The first backend failure is reported in place of the
//! counter's state and ends the stream. A stream that runs to completion ends
//! with exactly one hotplug status answer.

use super::protocol::{write_frame, Answer, Query};
use crate::backend::Backend;
use crate::counters::{Command, CounterId, CounterState, Registry};
use crate::error::BackendError;
use std::io;
use std::os::unix::net::UnixStream;
use tracing::{debug, warn};

/// Destination of a response stream
pub trait AnswerSink {
    fn send(&mut self, answer: Answer) -> io::Result<()>;
}

impl AnswerSink for UnixStream {
    fn send(&mut self, answer: Answer) -> io::Result<()> {
        write_frame(self, &answer.encode())
    }
}

impl AnswerSink for Vec<Answer> {
    fn send(&mut self, answer: Answer) -> io::Result<()> {
        self.push(answer);
        Ok(())
    }
}

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every in-scope counter answered, hotplug status sent last
    Completed { sent: usize },
    /// A backend call failed; the error answer was the last one sent
    Aborted { counter: u32, code: i32, sent: usize },
}

impl DispatchOutcome {
    pub fn sent(&self) -> usize {
        match self {
            DispatchOutcome::Completed { sent } | DispatchOutcome::Aborted { sent, .. } => *sent,
        }
    }
}

pub struct Dispatcher<'a> {
    registry: Registry<'a>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            registry: Registry::new(backend),
        }
    }

    /// Apply `query` and stream its answers into `sink`.
    ///
    /// Backend failures end up in the stream and in the returned outcome; an
    /// `Err` means the sink itself failed and the stream is incomplete.
    pub fn dispatch<S: AnswerSink>(&self, query: &Query, sink: &mut S) -> io::Result<DispatchOutcome> {
        let mut stream = Stream { sink, sent: 0 };
        let backend = self.registry.backend();

        for id in self.registry.in_scope(query.scope) {
            let answer = match self.apply(id, query.command) {
                Ok(answer) => answer,
                Err(e) => return stream.abort(id.to_wire(), e),
            };
            stream.send(answer)?;

            if id.is_composite()
                && query.command != Command::Disable
                && answer.state() == Some(CounterState::Enabled)
            {
                for index in 0..self.registry.sub_count(id) {
                    match backend.read_subcounter(id, index) {
                        Ok(value) => stream.send(Answer::subcounter(index, value))?,
                        Err(e) => return stream.abort(index as u32, e),
                    }
                }
            }
        }

        stream.send(Answer::hotplug(backend.read(CounterId::HotplugDetected)))?;
        Ok(DispatchOutcome::Completed { sent: stream.sent })
    }

    /// Run `command` against one counter and build its answer.
    fn apply(&self, id: CounterId, command: Command) -> Result<Answer, BackendError> {
        let backend = self.registry.backend();

        match command {
            Command::Enable => {
                if self.registry.state_of(id) == CounterState::Disabled {
                    backend.enable(id)?;
                }
                let state = self.registry.state_of(id);
                let value = match state {
                    CounterState::Unsupported => 0,
                    _ => backend.read(id)?,
                };
                Ok(Answer::counter(id, state, value))
            }
            Command::Disable => {
                if self.registry.state_of(id) == CounterState::Enabled {
                    backend.disable(id)?;
                }
                Ok(Answer::counter(id, self.registry.state_of(id), 0))
            }
            Command::Reset => {
                let state = self.registry.state_of(id);
                let value = match state {
                    CounterState::Enabled => backend.reset(id)?,
                    _ => 0,
                };
                Ok(Answer::counter(id, state, value))
            }
            Command::Print => {
                let state = self.registry.state_of(id);
                let value = match state {
                    CounterState::Enabled => backend.read(id)?,
                    _ => 0,
                };
                Ok(Answer::counter(id, state, value))
            }
        }
    }
}

struct Stream<'s, S> {
    sink: &'s mut S,
    sent: usize,
}

impl<S: AnswerSink> Stream<'_, S> {
    fn send(&mut self, answer: Answer) -> io::Result<()> {
        self.sink.send(answer)?;
        self.sent += 1;
        Ok(())
    }

    fn abort(&mut self, counter: u32, error: BackendError) -> io::Result<DispatchOutcome> {
        warn!("Counter {} failed with code {}, ending response", counter, error.code());
        self.send(Answer::failure(counter, error))?;
        debug!("Aborted after {} answers", self.sent);
        Ok(DispatchOutcome::Aborted {
            counter,
            code: error.code(),
            sent: self.sent,
        })
    }
}
