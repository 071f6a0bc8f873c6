//! Length-framed binary wire format
//!
//! Envelopes are serialized as JSON and framed with a 4-byte big-endian
//! length prefix. Used on persistent worker sockets, on ephemeral worker
//! pipes in binary mode, and on the orchestrator's stdin/stdout link.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::task::{Response, Task};

/// Maximum allowed frame payload (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Everything that travels inside a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    /// A task for the worker to evaluate
    Task(Task),

    /// The worker's terminal response
    Response(Response),
}

// ─────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────

/// Encode an envelope into a length-prefixed frame
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope).map_err(|e| Error::Envelope {
        message: "failed to serialize envelope".to_string(),
        source: Some(e),
    })?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one framed envelope to an async stream
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_envelope(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed envelope from an async stream
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;

    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload).map_err(|e| Error::Envelope {
        message: "failed to deserialize envelope".to_string(),
        source: Some(e),
    })
}

// ─────────────────────────────────────────────────────────────────
// Incremental decoding
// ─────────────────────────────────────────────────────────────────

/// Incremental decoder for framed envelopes.
///
/// Accepts arbitrary byte chunks and yields an envelope for every
/// complete frame, however the stream was split.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every envelope completed by it.
    ///
    /// A frame that exceeds the size cap or fails to deserialize is a
    /// fatal protocol error; the decoder must not be reused afterwards.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>> {
        self.buffer.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }

            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }

            if self.buffer.len() < 4 + len {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..4 + len).collect();
            let envelope = serde_json::from_slice(&frame[4..]).map_err(|e| Error::Envelope {
                message: "failed to deserialize envelope".to_string(),
                source: Some(e),
            })?;
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }

    /// Bytes buffered but not yet forming a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::task::Fitness;

    fn sample_response() -> Response {
        Response::success(vec![Fitness {
            name: "speed".to_string(),
            value: 1.5,
        }])
    }

    #[test]
    fn test_encode_prefixes_length() {
        let frame = encode_envelope(&Envelope::Response(sample_response())).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[test]
    fn test_decoder_single_frame() {
        let envelope = Envelope::Response(sample_response());
        let frame = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&frame).unwrap();
        assert_eq!(decoded, vec![envelope]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_split_frames() {
        let envelope = Envelope::Task(Task::new(3).with_setting("path", "/usr/bin/true"));
        let frame = encode_envelope(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        // Split inside the length prefix
        assert!(decoder.feed(&frame[..2]).unwrap().is_empty());
        // Split inside the payload
        assert!(decoder.feed(&frame[2..10]).unwrap().is_empty());
        let decoded = decoder.feed(&frame[10..]).unwrap();
        assert_eq!(decoded, vec![envelope]);
    }

    #[test]
    fn test_decoder_two_frames_one_chunk() {
        let first = Envelope::Response(sample_response());
        let second = Envelope::Response(Response::dispatcher_failure("boom"));

        let mut bytes = encode_envelope(&first).unwrap();
        bytes.extend(encode_envelope(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&bytes).unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut bytes = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&bytes).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn test_decoder_rejects_malformed_payload() {
        let payload = b"not json at all";
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);

        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&bytes).unwrap_err();
        assert!(matches!(err, Error::Envelope { .. }));
    }

    #[tokio::test]
    async fn test_async_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let envelope = Envelope::Task(
            Task::new(9)
                .with_setting("mode", "text")
                .with_parameter("alpha", 0.25, 0.0, 1.0),
        );

        write_envelope(&mut client, &envelope).await.unwrap();
        let received = read_envelope(&mut server).await.unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_async_read_oversized_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let _ = client
                .write_all(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes())
                .await;
        });

        let err = read_envelope(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
