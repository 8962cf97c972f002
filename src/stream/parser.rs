use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};

use super::{ContentBlock, ProgressEvent, RunResult, StreamEvent, describe_tool_use};
use crate::errors::StreamError;

/// Largest frame accepted by default. Tool results can embed whole files.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// What the parser learned from a complete stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseSummary {
    /// Resume identifier from the `system` init frame or any later frame.
    pub session_id: Option<String>,
    /// The first `result` frame, if one was seen.
    pub result: Option<RunResult>,
}

/// Decodes newline-delimited JSON frames into `ProgressEvent`s.
#[derive(Debug, Clone)]
pub struct StreamParser {
    max_frame_bytes: usize,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl StreamParser {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Read `reader` to the end, forwarding events in stream order.
    ///
    /// Malformed lines are logged and skipped. Only an oversized frame or an
    /// I/O failure aborts parsing. A dropped receiver does not stop parsing,
    /// so the terminal result is still captured.
    pub async fn parse<R>(
        &self,
        reader: R,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> Result<ParseSummary, StreamError>
    where
        R: AsyncRead + Unpin,
    {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), self.max_frame_bytes);
        let mut frames = FramedRead::new(reader, codec);
        let mut summary = ParseSummary::default();
        let mut receiver_gone = false;
        let mut line_no = 0usize;

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    return Err(StreamError::FrameTooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                Err(AnyDelimiterCodecError::Io(e)) => return Err(StreamError::Io(e)),
            };
            line_no += 1;

            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event: StreamEvent = match serde_json::from_slice(&frame) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(line = line_no, error = %e, "skipping unparseable stream frame");
                    continue;
                }
            };

            for progress in self.interpret(event, &mut summary) {
                if receiver_gone {
                    continue;
                }
                if events.send(progress).await.is_err() {
                    tracing::debug!("progress receiver dropped; continuing to drain stream");
                    receiver_gone = true;
                }
            }
        }

        Ok(summary)
    }

    fn interpret(&self, event: StreamEvent, summary: &mut ParseSummary) -> Vec<ProgressEvent> {
        match event {
            StreamEvent::System {
                subtype,
                session_id,
            } => {
                if let Some(id) = session_id {
                    tracing::debug!(subtype = %subtype, session_id = %id, "generator session");
                    summary.session_id = Some(id);
                }
                Vec::new()
            }
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                if summary.session_id.is_none() {
                    summary.session_id = session_id;
                }
                message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } if !text.is_empty() => {
                            Some(ProgressEvent::Text(text))
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let summary = describe_tool_use(&name, &input);
                            Some(ProgressEvent::ToolUse { name, summary })
                        }
                        _ => None,
                    })
                    .collect()
            }
            StreamEvent::Result(frame) => {
                if summary.result.is_some() {
                    tracing::warn!(subtype = %frame.subtype, "ignoring additional result frame");
                    return Vec::new();
                }
                if let Some(id) = &frame.session_id {
                    summary.session_id = Some(id.clone());
                }
                let result = RunResult::from(frame);
                summary.result = Some(result.clone());
                vec![ProgressEvent::Completed(result)]
            }
            StreamEvent::Other => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_all(input: &str, parser: &StreamParser) -> (Result<ParseSummary, StreamError>, Vec<ProgressEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = parser.parse(input.as_bytes(), &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#;
    const TOOL: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/repo/src/routes/health.rs"},"id":"t1"}]}}"#;
    const TEXT: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Added the endpoint."}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"Added the endpoint.","num_turns":3,"total_cost_usd":0.02,"duration_ms":9000,"session_id":"sess-1"}"#;

    #[tokio::test]
    async fn test_valid_stream_yields_ordered_events_and_one_completion() {
        let input = [INIT, TOOL, TEXT, RESULT].join("\n");
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        let summary = summary.unwrap();

        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
        assert_eq!(summary.result.as_ref().unwrap().num_turns, 3);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0],
            ProgressEvent::ToolUse {
                name: "Write".to_string(),
                summary: "Created .../routes/health.rs".to_string()
            }
        );
        assert_eq!(events[1], ProgressEvent::Text("Added the endpoint.".to_string()));
        assert!(matches!(&events[2], ProgressEvent::Completed(r) if !r.is_error));
    }

    #[tokio::test]
    async fn test_invalid_line_between_frames_is_skipped() {
        let input = [TOOL, "{not json at all", "", TEXT, RESULT].join("\n");
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        assert!(summary.unwrap().result.is_some());
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProgressEvent::ToolUse { .. }));
        assert!(matches!(events[1], ProgressEvent::Text(_)));
    }

    #[tokio::test]
    async fn test_additional_result_frames_are_ignored() {
        let second = RESULT.replace("\"num_turns\":3", "\"num_turns\":9");
        let input = [RESULT, second.as_str()].join("\n");
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        assert_eq!(summary.unwrap().result.unwrap().num_turns, 3);
        let completions = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Completed(_)))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_stream_without_result_reports_none() {
        let input = [INIT, TOOL].join("\n");
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        assert!(summary.unwrap().result.is_none());
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let big = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            "a".repeat(512)
        );
        let input = [TOOL, big.as_str(), RESULT].join("\n");
        let (result, events) = parse_all(&input, &StreamParser::new(256)).await;
        assert!(matches!(
            result,
            Err(StreamError::FrameTooLarge { limit: 256 })
        ));
        // Frames before the oversized one were already forwarded.
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_frame_of_one_megabyte_is_tolerated() {
        let text = "b".repeat(1_000_000);
        let frame = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            text
        );
        let input = [frame.as_str(), RESULT].join("\n");
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        assert!(summary.unwrap().result.is_some());
        assert!(matches!(&events[0], ProgressEvent::Text(t) if t.len() == 1_000_000));
    }

    #[tokio::test]
    async fn test_dropped_receiver_still_captures_result() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = [TOOL, TEXT, RESULT].join("\n");
        let summary = StreamParser::default()
            .parse(input.as_bytes(), &tx)
            .await
            .unwrap();
        assert!(summary.result.is_some());
    }

    #[tokio::test]
    async fn test_crlf_and_trailing_newline() {
        let input = format!("{}\r\n{}\r\n", TEXT, RESULT);
        let (summary, events) = parse_all(&input, &StreamParser::default()).await;
        assert!(summary.unwrap().result.is_some());
        assert_eq!(events.len(), 2);
    }
}
