//! Wire protocol between orchestrator, dispatcher and workers
//!
//! Two formats carry the same task/response data model: a line-oriented
//! text format for simple script workers and a length-framed JSON
//! envelope format for everything else. The orchestrator link always
//! uses the framed format.

mod frame;
mod task;
mod text;

pub use frame::{
    encode_envelope, read_envelope, write_envelope, Envelope, FrameDecoder, MAX_FRAME_SIZE,
};
pub use task::{FailureKind, Fitness, Parameter, Response, Setting, Task};
pub use text::{encode_task, TextDecoder};

use crate::error::{Error, Result};

/// Which wire format a worker speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Tab-separated lines, blank-line terminated responses
    Text,
    /// Length-framed JSON envelopes
    Binary,
}

impl WireMode {
    /// Select the wire mode requested by a task's `mode` setting
    pub fn for_task(task: &Task) -> Self {
        if task.text_mode() {
            WireMode::Text
        } else {
            WireMode::Binary
        }
    }
}

/// Encode a task for transmission in the given wire mode
pub fn encode_task_bytes(task: &Task, mode: WireMode) -> Result<Vec<u8>> {
    match mode {
        WireMode::Text => Ok(encode_task(task).into_bytes()),
        WireMode::Binary => encode_envelope(&Envelope::Task(task.clone())),
    }
}

/// Stateful response decoder, tolerant of arbitrary read chunking.
///
/// Wraps the mode-specific decoders behind one interface so the
/// dispatch loops do not care which format the worker speaks.
#[derive(Debug)]
pub struct ResponseDecoder {
    inner: DecoderKind,
}

#[derive(Debug)]
enum DecoderKind {
    Text(TextDecoder),
    Binary(FrameDecoder),
}

impl ResponseDecoder {
    pub fn new(mode: WireMode) -> Self {
        let inner = match mode {
            WireMode::Text => DecoderKind::Text(TextDecoder::new()),
            WireMode::Binary => DecoderKind::Binary(FrameDecoder::new()),
        };
        Self { inner }
    }

    /// Feed a chunk of bytes, returning every response completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Response>> {
        match &mut self.inner {
            DecoderKind::Text(decoder) => Ok(decoder.feed(chunk)),
            DecoderKind::Binary(decoder) => {
                let envelopes = decoder.feed(chunk)?;
                envelopes
                    .into_iter()
                    .map(|envelope| match envelope {
                        Envelope::Response(response) => Ok(response),
                        Envelope::Task(_) => Err(Error::EnvelopeUnexpected {
                            expected: "response",
                        }),
                    })
                    .collect()
            }
        }
    }
}
