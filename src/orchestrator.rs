//! Link to the orchestration framework
//!
//! The orchestrator hands the dispatcher exactly one task on stdin and
//! expects exactly one terminal response on stdout, both as framed
//! envelopes. Logging stays on stderr so the response frame owns stdout.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{read_envelope, write_envelope, Envelope, Response, Task};

/// Read the single task frame from the orchestrator.
pub async fn read_task<R>(reader: &mut R) -> Result<Task>
where
    R: AsyncRead + Unpin,
{
    let envelope = read_envelope(reader).await.map_err(|e| match e {
        Error::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
            Error::task_read("orchestrator closed the stream before sending a task")
        }
        Error::Io(io) => Error::TaskRead {
            message: "could not read task frame".to_string(),
            source: Some(io),
        },
        other => other,
    })?;

    match envelope {
        Envelope::Task(task) => {
            debug!(
                task_id = task.id,
                settings = task.settings.len(),
                parameters = task.parameters.len(),
                "Task received"
            );
            Ok(task)
        }
        Envelope::Response(_) => Err(Error::EnvelopeUnexpected { expected: "task" }),
    }
}

/// Writes the terminal response back to the orchestrator.
///
/// At most one response ever goes out on a sink; later sends are
/// dropped with a warning.
#[derive(Debug)]
pub struct ResponseSink<W> {
    writer: W,
    sent: bool,
}

impl<W> ResponseSink<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sent: false,
        }
    }

    /// Send the terminal response and flush.
    pub async fn send(&mut self, response: &Response) -> Result<()> {
        if self.sent {
            warn!("Dropping extra terminal response");
            return Ok(());
        }

        write_envelope(&mut self.writer, &Envelope::Response(response.clone()))
            .await
            .map_err(|e| match e {
                Error::Io(source) => Error::ResponseWrite { source },
                other => other,
            })?;
        self.sent = true;
        Ok(())
    }

    /// Whether a response has already been written
    pub fn sent(&self) -> bool {
        self.sent
    }
}
