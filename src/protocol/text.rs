//! Line-oriented text wire format
//!
//! Tasks are rendered as tab-separated `setting` and `parameter` lines;
//! responses come back as a block terminated by a blank line. The first
//! line of the block is `success` followed by one `name value` fitness
//! pair per line; any other first line marks a failure, with the
//! remaining lines forming the failure message.

use tracing::warn;

use crate::protocol::task::{Fitness, Response, Task};

/// Terminator for a text-mode response block
const BLOCK_TERMINATOR: &[u8] = b"\n\n";

// ─────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────

/// Render a task in the text wire format.
///
/// Settings come first, one per line, then a blank line, then the
/// parameters. The end of the task is signalled by closing the stream.
pub fn encode_task(task: &Task) -> String {
    let mut out = String::new();

    for setting in &task.settings {
        out.push_str("setting\t");
        out.push_str(&setting.key);
        out.push('\t');
        out.push_str(&setting.value);
        out.push('\n');
    }

    out.push('\n');

    for param in &task.parameters {
        out.push_str(&format!(
            "parameter\t{}\t{}\t{}\t{}\n",
            param.name, param.value, param.min, param.max
        ));
    }

    out
}

// ─────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────

/// Incremental decoder for text-mode responses.
///
/// Accepts arbitrary byte chunks and yields a response for every
/// blank-line-terminated block, however the stream was split.
#[derive(Debug, Default)]
pub struct TextDecoder {
    buffer: Vec<u8>,
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every response completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Response> {
        self.buffer.extend_from_slice(chunk);

        let mut responses = Vec::new();
        while let Some(end) = find_terminator(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + BLOCK_TERMINATOR.len()).collect();
            let text = String::from_utf8_lossy(&block[..end]);
            responses.push(parse_block(&text));
        }

        responses
    }

    /// Bytes buffered but not yet forming a complete block
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the first blank-line terminator in the buffer
fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(BLOCK_TERMINATOR.len())
        .position(|w| w == BLOCK_TERMINATOR)
}

/// Parse one complete response block (terminator already removed)
fn parse_block(text: &str) -> Response {
    let parts: Vec<&str> = text.split('\n').collect();

    if parts[0] != "success" {
        // Everything after the status line is the failure message
        let message = parts[1..].join("\n");
        return Response::dispatcher_failure(message);
    }

    let mut fitness = Vec::new();
    for line in &parts[1..] {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }

        let mut tokens = stripped.split_whitespace();
        let name = tokens.next().unwrap_or_default();
        match tokens.next().and_then(|v| v.parse::<f64>().ok()) {
            Some(value) => fitness.push(Fitness {
                name: name.to_string(),
                value,
            }),
            None => {
                warn!(line = stripped, "Skipping unparseable fitness line");
            }
        }
    }

    Response::success(fitness)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::task::FailureKind;

    fn feed_all(decoder: &mut TextDecoder, data: &[u8]) -> Vec<Response> {
        decoder.feed(data)
    }

    #[test]
    fn test_encode_task() {
        let task = Task::new(1)
            .with_setting("path", "/usr/bin/evaluate")
            .with_setting("mode", "text")
            .with_parameter("alpha", 0.5, 0.0, 1.0)
            .with_parameter("beta", 2.0, -4.0, 4.0);

        let encoded = encode_task(&task);
        assert_eq!(
            encoded,
            "setting\tpath\t/usr/bin/evaluate\n\
             setting\tmode\ttext\n\
             \n\
             parameter\talpha\t0.5\t0\t1\n\
             parameter\tbeta\t2\t-4\t4\n"
        );
    }

    #[test]
    fn test_encode_task_no_settings() {
        let task = Task::new(1).with_parameter("x", 1.0, 0.0, 2.0);
        let encoded = encode_task(&task);
        assert!(encoded.starts_with('\n'));
        assert!(encoded.contains("parameter\tx\t1\t0\t2\n"));
    }

    #[test]
    fn test_decode_success_with_fitness() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"success\nspeed 1.5\ndistance 30\n\n");

        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Success { fitness } => {
                assert_eq!(fitness.len(), 2);
                assert_eq!(fitness[0].name, "speed");
                assert_eq!(fitness[0].value, 1.5);
                assert_eq!(fitness[1].name, "distance");
                assert_eq!(fitness[1].value, 30.0);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_success_no_fitness() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"success\n\n");

        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_success());
    }

    #[test]
    fn test_decode_failure_message() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"failed\nout of range\nno sensor data\n\n");

        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Failed { kind, message } => {
                assert_eq!(*kind, FailureKind::Dispatcher);
                // The status line itself is not part of the message
                assert_eq!(message, "out of range\nno sensor data");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_block_is_failure() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"\n\n");

        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Failed { kind, message } => {
                assert_eq!(*kind, FailureKind::Dispatcher);
                assert!(message.is_empty());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_malformed_fitness_skipped() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"success\nspeed fast\ndistance 30\n\n");

        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Success { fitness } => {
                // "speed fast" has no numeric value and is dropped
                assert_eq!(fitness.len(), 1);
                assert_eq!(fitness[0].name, "distance");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_blank_fitness_lines_skipped() {
        let mut decoder = TextDecoder::new();
        let responses = feed_all(&mut decoder, b"success\n   \nspeed 2\n\n");

        assert_eq!(responses.len(), 1);
        match &responses[0] {
            Response::Success { fitness } => {
                assert_eq!(fitness.len(), 1);
                assert_eq!(fitness[0].name, "speed");
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_chunking_invariance() {
        let stream = b"success\nspeed 1.5\ndistance 30\n\n";

        // Whole stream at once
        let mut whole = TextDecoder::new();
        let expected = whole.feed(stream);

        // Byte by byte
        let mut bytewise = TextDecoder::new();
        let mut collected = Vec::new();
        for byte in stream.iter() {
            collected.extend(bytewise.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(collected, expected);

        // Split in the middle of the terminator
        let mut split = TextDecoder::new();
        let mut collected = split.feed(&stream[..stream.len() - 1]);
        assert!(collected.is_empty());
        collected.extend(split.feed(&stream[stream.len() - 1..]));
        assert_eq!(collected, expected);
    }

    #[test]
    fn test_incomplete_block_yields_nothing() {
        let mut decoder = TextDecoder::new();
        assert!(decoder.feed(b"success\nspeed 1.5\n").is_empty());
        assert!(decoder.pending() > 0);
    }

    #[test]
    fn test_two_blocks_one_chunk() {
        let mut decoder = TextDecoder::new();
        let responses = decoder.feed(b"success\na 1\n\nfailed\nboom\n\n");

        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_success());
        assert!(!responses[1].is_success());
    }

    #[test]
    fn test_trailing_bytes_stay_buffered() {
        let mut decoder = TextDecoder::new();
        let responses = decoder.feed(b"success\n\nsucc");

        assert_eq!(responses.len(), 1);
        assert_eq!(decoder.pending(), 4);
    }
}
