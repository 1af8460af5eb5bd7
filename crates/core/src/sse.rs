//! Server-Sent-Events frame parser.
//!
//! The parser is a pure function of text in, events out. Chunks may split a
//! frame anywhere, including mid-line or in the middle of a JSON token; the
//! trailing partial line is kept in the buffer until its newline arrives.

use crate::protocol::ProtocolEvent;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";
const PREVIEW_LEN: usize = 120;

/// Incremental decoder from raw SSE text to [`ProtocolEvent`]s.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns the events completed by it, in order.
    pub fn add_data(&mut self, chunk: &str) -> Vec<ProtocolEvent> {
        self.buffer.push_str(chunk);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let partial = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, partial);

        complete.split('\n').filter_map(parse_line).collect()
    }

    /// Parses whatever is left in the buffer and clears it. Call at end of stream.
    pub fn flush(&mut self) -> Vec<ProtocolEvent> {
        let residual = std::mem::take(&mut self.buffer);
        residual.split('\n').filter_map(parse_line).collect()
    }

    /// The buffered partial line, if any.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Parses one line. Lines without the `data: ` prefix are not frames.
fn parse_line(line: &str) -> Option<ProtocolEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;

    if payload.trim() == DONE_SENTINEL {
        return Some(ProtocolEvent::Done);
    }

    match serde_json::from_str::<ProtocolEvent>(payload) {
        Ok(event) => {
            debug!(kind = event.kind(), "Parsed SSE frame");
            Some(event)
        }
        Err(e) => {
            warn!(
                error = %e,
                payload = %preview(payload),
                "Dropping malformed SSE frame"
            );
            None
        }
    }
}

fn preview(payload: &str) -> String {
    if payload.chars().count() <= PREVIEW_LEN {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(PREVIEW_LEN).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "data: {\"type\":\"metadata\",\"conversation_id\":\"srv-1\"}\n",
        "\n",
        "data: {\"type\":\"status\",\"message\":\"Đang tìm kiếm...\"}\n",
        "\n",
        "data: {\"type\":\"sources\",\"source_references\":[{\"chunk_id\":\"7\",\"relevance_score\":0.91}],\"confidence\":0.8}\n",
        "\n",
        "data: {\"type\":\"answer_chunk\",\"content\":\"Chào \"}\n",
        "\n",
        "data: {\"type\":\"answer_chunk\",\"content\":\"bạn\"}\n",
        "\n",
        "data: {\"type\":\"complete\",\"attachments\":[],\"chart_data\":[]}\n",
        "\n",
        "data: {\"type\":\"done\"}\n",
        "\n",
    );

    fn parse_all(chunks: &[&str]) -> Vec<ProtocolEvent> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.add_data(chunk));
        }
        events.extend(parser.flush());
        events
    }

    #[test]
    fn test_whole_payload_in_one_call() {
        let events = parse_all(&[STREAM]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["metadata", "status", "sources", "answer_chunk", "answer_chunk", "complete", "done"]
        );
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let expected = parse_all(&[STREAM]);

        // Every single split point, on char boundaries.
        for (split, _) in STREAM.char_indices() {
            let (a, b) = STREAM.split_at(split);
            assert_eq!(parse_all(&[a, b]), expected, "split at {}", split);
        }

        // Char-at-a-time.
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        let mut buf = [0u8; 4];
        for c in STREAM.chars() {
            events.extend(parser.add_data(c.encode_utf8(&mut buf)));
        }
        events.extend(parser.flush());
        assert_eq!(events, expected);
    }

    #[test]
    fn test_partial_line_is_kept_until_newline() {
        let mut parser = SseParser::new();
        assert!(parser.add_data("data: {\"type\":\"answer_").is_empty());
        assert_eq!(parser.pending(), "data: {\"type\":\"answer_");
        let events = parser.add_data("chunk\",\"content\":\"x\"}\ndata: {\"ty");
        assert_eq!(
            events,
            vec![ProtocolEvent::AnswerChunk {
                content: "x".to_string()
            }]
        );
        assert_eq!(parser.pending(), "data: {\"ty");
    }

    #[test]
    fn test_flush_parses_trailing_line_without_newline() {
        let mut parser = SseParser::new();
        assert!(parser.add_data("data: {\"type\":\"done\"}").is_empty());
        assert_eq!(parser.flush(), vec![ProtocolEvent::Done]);
        assert_eq!(parser.pending(), "");
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn test_non_frame_lines_are_skipped() {
        let noisy = concat!(
            ": keep-alive comment\n",
            "\n",
            "event: message\n",
            "data: {\"type\":\"answer_chunk\",\"content\":\"a\"}\n",
            "\n\n",
            "id: 4\n",
            "data: {\"type\":\"done\"}\n",
        );
        let clean = concat!(
            "data: {\"type\":\"answer_chunk\",\"content\":\"a\"}\n",
            "data: {\"type\":\"done\"}\n",
        );
        assert_eq!(parse_all(&[noisy]), parse_all(&[clean]));
        assert_eq!(parse_all(&[clean]).len(), 2);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let stream = concat!(
            "data: {\"type\":\"answer_chunk\",\"content\":\"first\"}\n",
            "data: {\"type\":\"answer_chunk\",\"content\":\n",
            "data: {\"type\":\"answer_chunk\",\"content\":\"second\"}\n",
        );
        assert_eq!(
            parse_all(&[stream]),
            vec![
                ProtocolEvent::AnswerChunk {
                    content: "first".to_string()
                },
                ProtocolEvent::AnswerChunk {
                    content: "second".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_done_sentinel_is_not_json_parsed() {
        // `[DONE]` is not a valid ProtocolEvent as JSON, so reaching the JSON
        // path would drop it instead of yielding `Done`.
        assert!(serde_json::from_str::<ProtocolEvent>(DONE_SENTINEL).is_err());
        assert_eq!(parse_all(&["data: [DONE]\n"]), vec![ProtocolEvent::Done]);
        assert_eq!(parse_all(&["data:  [DONE] \r\n"]), vec![ProtocolEvent::Done]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let events = parse_all(&["data: {\"type\":\"status\",\"message\":\"ok\"}\r\n\r\n"]);
        assert_eq!(
            events,
            vec![ProtocolEvent::Status {
                message: "ok".to_string()
            }]
        );
    }

    #[test]
    fn test_prefix_without_space_is_not_a_frame() {
        assert!(parse_all(&["data:{\"type\":\"done\"}\n"]).is_empty());
    }

    #[test]
    fn test_preview_truncates_long_payloads() {
        let long = "x".repeat(500);
        assert_eq!(preview(&long).len(), PREVIEW_LEN + 3);
        assert_eq!(preview("short"), "short");
    }
}
