use serde_json::Value;
use tracing::debug;

use crate::error::{FrameError, StreamError};
use crate::events::Event;

/// Largest partial object kept between chunks before giving up on the stream.
/// Scanning resumes where the previous chunk stopped, so a large object
/// costs time linear in its size however finely it is chunked.
pub const DEFAULT_MAX_PENDING: usize = 8 * 1024 * 1024;

/// Where the scanner is relative to JSON string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Outside,
    InString,
    /// Previous byte was a backslash inside a string.
    Escape,
}

/// Splits back-to-back JSON objects out of an arbitrarily chunked text stream.
///
/// The backend writes objects with no delimiter between them and the
/// transport may cut anywhere, so the extractor keeps whatever it hasn't
/// resolved yet, along with where the scan stopped inside it, and picks up
/// from there when the next chunk arrives. Braces inside string literals are
/// ignored, so token text containing `{` or `}` does not break framing.
///
/// One instance per stream. Feed chunks in arrival order from a single task.
#[derive(Debug)]
pub struct FrameExtractor {
    /// Unresolved text. While an object is open it starts at that object's `{`.
    buffer: String,
    /// Bytes of `buffer` already scanned.
    scanned: usize,
    depth: usize,
    lexical: Lexical,
    max_pending: usize,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            scanned: 0,
            depth: 0,
            lexical: Lexical::Outside,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn with_max_pending(mut self, limit: usize) -> Self {
        self.max_pending = limit;
        self
    }

    /// Feed one chunk. Returns every object it completed, in the order their
    /// closing braces appeared, with malformed objects reported in place.
    pub fn process(&mut self, chunk: &str) -> Vec<Result<Event, FrameError>> {
        let mut out = Vec::new();
        self.scan(chunk, &mut |frame: Result<Event, FrameError>| out.push(frame));
        out
    }

    /// Callback form of [`process`](Self::process).
    pub fn process_with(
        &mut self,
        chunk: &str,
        mut on_event: impl FnMut(Event),
        mut on_error: impl FnMut(FrameError),
    ) {
        self.scan(chunk, &mut |frame: Result<Event, FrameError>| match frame {
            Ok(event) => on_event(event),
            Err(e) => on_error(e),
        });
    }

    /// Text received but not yet resolved into an object.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Close the stream. A non-empty tail means an object was cut off.
    pub fn finish(self) -> Result<(), StreamError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(StreamError::Unterminated {
                pending: self.buffer.len(),
            })
        }
    }

    fn scan(&mut self, chunk: &str, emit: &mut dyn FnMut(Result<Event, FrameError>)) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.push_str(chunk);

        let mut depth = self.depth;
        let mut lexical = self.lexical;
        let mut start = (depth > 0).then_some(0);
        let mut frames = 0usize;

        // Structural bytes are all ASCII, so every index we slice at is a char boundary.
        for (i, &b) in self.buffer.as_bytes().iter().enumerate().skip(self.scanned) {
            if depth > 0 {
                match lexical {
                    Lexical::Escape => {
                        lexical = Lexical::InString;
                        continue;
                    }
                    Lexical::InString => {
                        match b {
                            b'\\' => lexical = Lexical::Escape,
                            b'"' => lexical = Lexical::Outside,
                            _ => {}
                        }
                        continue;
                    }
                    Lexical::Outside if b == b'"' => {
                        lexical = Lexical::InString;
                        continue;
                    }
                    Lexical::Outside => {}
                }
            }

            match b {
                b'{' => {
                    if depth == 0 {
                        start = Some(i);
                    }
                    depth += 1;
                }
                // A stray `}` between objects is noise.
                b'}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            frames += 1;
                            emit(decode(&self.buffer[s..=i]));
                        }
                    }
                }
                _ => {}
            }
        }

        match start {
            Some(s) => {
                self.buffer.drain(..s);
                self.scanned = self.buffer.len();
                self.depth = depth;
                self.lexical = lexical;
            }
            None => self.reset(),
        }

        debug!(
            chunk_len = chunk.len(),
            frames,
            pending = self.buffer.len(),
            "scanned chunk"
        );

        if self.buffer.len() > self.max_pending {
            let len = self.buffer.len();
            self.reset();
            emit(Err(FrameError::Overflow {
                len,
                limit: self.max_pending,
            }));
        }
    }
}

impl FrameExtractor {
    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.depth = 0;
        self.lexical = Lexical::Outside;
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(raw: &str) -> Result<Event, FrameError> {
    serde_json::from_str::<Value>(raw)
        .map(Event::from_value)
        .map_err(|source| FrameError::Malformed {
            raw: raw.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TURN: &str = r#"{"event":"start"}{"event":"token","data":"Hi"}{"event":"token","data":" there"}{"event":"end","data":{"final_answer":"Hi there"}}"#;

    fn events_of(frames: Vec<Result<Event, FrameError>>) -> Vec<Event> {
        frames.into_iter().map(|f| f.unwrap()).collect()
    }

    /// Feed `input` split into pieces of at most `size` chars.
    fn feed_in_pieces(input: &str, size: usize) -> Vec<Event> {
        let mut extractor = FrameExtractor::new();
        let chars: Vec<char> = input.chars().collect();
        let mut events = Vec::new();
        for piece in chars.chunks(size) {
            let piece: String = piece.iter().collect();
            events.extend(events_of(extractor.process(&piece)));
        }
        assert!(extractor.pending().is_empty());
        events
    }

    #[test]
    fn single_chunk_yields_all_objects_in_order() {
        let mut extractor = FrameExtractor::new();
        let events = events_of(extractor.process(TURN));
        assert_eq!(
            events,
            vec![
                Event::Start(None),
                Event::Token("Hi".into()),
                Event::Token(" there".into()),
                Event::End(Some(json!({"final_answer": "Hi there"}))),
            ]
        );
        assert!(extractor.finish().is_ok());
    }

    #[test]
    fn chunking_does_not_change_output() {
        let whole = feed_in_pieces(TURN, TURN.len());
        for size in [1, 2, 3, 7, 16, 33] {
            assert_eq!(feed_in_pieces(TURN, size), whole, "piece size {size}");
        }
    }

    #[test]
    fn order_is_preserved_across_chunks() {
        let input = r#"{"event":"token","data":"A"}{"event":"token","data":"B"}{"event":"end","data":"X"}"#;
        let events = feed_in_pieces(input, 5);
        assert_eq!(
            events,
            vec![
                Event::Token("A".into()),
                Event::Token("B".into()),
                Event::End(Some(json!("X"))),
            ]
        );
    }

    #[test]
    fn partial_object_waits_for_the_rest() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.process(r#"{"event":"to"#).is_empty());
        assert_eq!(extractor.pending(), r#"{"event":"to"#);

        let events = events_of(extractor.process(r#"ken","data":"hi"}"#));
        assert_eq!(events, vec![Event::Token("hi".into())]);
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn malformed_object_is_isolated() {
        let mut extractor = FrameExtractor::new();
        let frames =
            extractor.process(r#"{"event":"token","data":"ok"}{bad json here}{"event":"end"}"#);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().unwrap(), &Event::Token("ok".into()));
        match &frames[1] {
            Err(FrameError::Malformed { raw, .. }) => assert_eq!(raw, "{bad json here}"),
            other => panic!("expected malformed frame, got {other:?}"),
        }
        assert_eq!(frames[2].as_ref().unwrap(), &Event::End(None));
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn callback_form_splits_events_and_errors() {
        let mut extractor = FrameExtractor::new();
        let mut events = Vec::new();
        let mut errors = Vec::new();
        extractor.process_with(
            r#"{"event":"token","data":"ok"}{nope}{"event":"end"}"#,
            |e| events.push(e),
            |e| errors.push(e),
        );
        assert_eq!(events.len(), 2);
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].is_fatal());
    }

    #[test]
    fn empty_chunk_leaves_state_alone() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.process("").is_empty());

        extractor.process(r#"{"event":"tok"#);
        assert!(extractor.process("").is_empty());
        assert_eq!(extractor.pending(), r#"{"event":"tok"#);
    }

    #[test]
    fn braces_inside_strings_do_not_break_framing() {
        let input = r#"{"event":"token","data":"fn main() {"}{"event":"token","data":"}"}{"event":"token","data":"say \"{hi}\" \\"}"#;
        let expected = vec![
            Event::Token("fn main() {".into()),
            Event::Token("}".into()),
            Event::Token(r#"say "{hi}" \"#.into()),
        ];
        assert_eq!(feed_in_pieces(input, input.len()), expected);
        assert_eq!(feed_in_pieces(input, 1), expected);
    }

    #[test]
    fn multibyte_text_survives_char_splits() {
        let input = r#"{"event":"token","data":"héllo wörld ✓ 🚀"}"#;
        assert_eq!(
            feed_in_pieces(input, 1),
            vec![Event::Token("héllo wörld ✓ 🚀".into())]
        );
    }

    #[test]
    fn noise_between_objects_is_dropped() {
        let mut extractor = FrameExtractor::new();
        let events = events_of(extractor.process("\n} data: {\"event\":\"start\"}\n\n"));
        assert_eq!(events, vec![Event::Start(None)]);
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn nested_objects_are_one_frame() {
        let mut extractor = FrameExtractor::new();
        let events = events_of(
            extractor.process(r#"{"event":"agentFlowExecutedData","data":[{"nodeId":"a","data":{"x":{}}}]}"#),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "agentFlowExecutedData");
    }

    #[test]
    fn unterminated_tail_fails_finish() {
        let mut extractor = FrameExtractor::new();
        extractor.process(r#"{"event":"token","data":"ok"}{"event":"end","da"#);
        match extractor.finish() {
            Err(StreamError::Unterminated { pending }) => {
                assert_eq!(pending, r#"{"event":"end","da"#.len())
            }
            other => panic!("expected unterminated, got {other:?}"),
        }
    }

    #[test]
    fn oversized_partial_object_overflows() {
        let mut extractor = FrameExtractor::new().with_max_pending(16);
        let frames = extractor.process(r#"{"event":"token","data":"this never closes"#);
        assert_eq!(frames.len(), 1);
        let err = frames.into_iter().next().unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn scan_resumes_inside_string_escape() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.process(r#"{"event":"token","data":"a"#).is_empty());
        assert!(extractor.process(r#""}"#).is_empty());
        assert!(extractor.process("{").is_empty());
        let events = events_of(extractor.process(r#""}"#));
        assert_eq!(events, vec![Event::Token(r#"a"}{"#.into())]);
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn large_object_in_small_chunks() {
        let text = "x{y}\\\"z".repeat(50_000);
        let body =
            serde_json::to_string(&json!({"event": "token", "data": text.clone()})).unwrap();
        let mut extractor = FrameExtractor::new();
        let mut events = Vec::new();
        for piece in body.as_bytes().chunks(64) {
            let piece = std::str::from_utf8(piece).unwrap();
            events.extend(events_of(extractor.process(piece)));
        }
        events.extend(events_of(extractor.process(r#"{"event":"end"}"#)));
        assert_eq!(events, vec![Event::Token(text), Event::End(None)]);
        assert!(extractor.pending().is_empty());
    }

    #[test]
    fn overflow_resets_scan_state() {
        let mut extractor = FrameExtractor::new().with_max_pending(16);
        extractor.process(r#"{"event":"token","data":"never closes"#);
        let events = events_of(extractor.process(r#"{"event":"end"}"#));
        assert_eq!(events, vec![Event::End(None)]);
    }
}
