//! JSON documents sent back to back on a stream.
//!
//! A document ends when its outermost bracket closes. Brackets inside strings are skipped.

use serde_json::Value;

use super::FrameError;

pub const DEFAULT_MAX_DOCUMENT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Structure,
    Text,
    Escape,
}

pub struct Splitter {
    state: State,
    depth: usize,
    buf: Vec<u8>,
    max_document: usize,
}

impl Splitter {
    pub fn new(max_document: usize) -> Self {
        Self {
            state: State::Structure,
            depth: 0,
            buf: Vec::new(),
            max_document,
        }
    }

    fn fail(&mut self, e: FrameError) -> Result<Option<Value>, FrameError> {
        self.state = State::Structure;
        self.depth = 0;
        self.buf.clear();
        Err(e)
    }

    pub fn push_byte(&mut self, byte: u8) -> Result<Option<Value>, FrameError> {
        // whitespace between documents
        if self.depth == 0 && self.state == State::Structure && !matches!(byte, b'{' | b'[') {
            if byte.is_ascii_whitespace() {
                return Ok(None);
            }
            return self.fail(FrameError::InvalidHeader(byte));
        }
        if self.buf.len() >= self.max_document {
            let len = self.buf.len() + 1;
            return self.fail(FrameError::TooLarge(len, self.max_document));
        }
        self.buf.push(byte);
        match self.state {
            State::Structure => match byte {
                b'{' | b'[' => self.depth += 1,
                // depth is at least one here, documents must open with a bracket
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let doc = serde_json::from_slice(&self.buf);
                        self.buf.clear();
                        return match doc {
                            Ok(v) => Ok(Some(v)),
                            Err(e) => self.fail(FrameError::InvalidJson(e.to_string())),
                        };
                    }
                }
                b'"' => self.state = State::Text,
                _ => {}
            },
            State::Text => match byte {
                b'"' => self.state = State::Structure,
                b'\\' => self.state = State::Escape,
                _ => {}
            },
            State::Escape => self.state = State::Text,
        }
        Ok(None)
    }

    /// Feed chunk, returns every completed document.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>, FrameError> {
        let mut out = Vec::new();
        for b in chunk {
            if let Some(doc) = self.push_byte(*b)? {
                out.push(doc);
            }
        }
        Ok(out)
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENT)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::Splitter;
    use crate::frame::FrameError;

    #[test]
    fn documents_across_chunks() {
        let mut s = Splitter::default();
        let data = br#"{"type":"response","data":{"s":"}{\""}} [1,[2]]{"a":1}"#;
        let mut docs = Vec::new();
        for chunk in data.chunks(3) {
            docs.extend(s.push(chunk).unwrap());
        }
        assert_eq!(
            docs,
            vec![
                json!({"type": "response", "data": {"s": "}{\""}}),
                json!([1, [2]]),
                json!({"a": 1}),
            ]
        );
    }

    #[test]
    fn garbage_and_limits() {
        let mut s = Splitter::default();
        assert_eq!(s.push(b"x"), Err(FrameError::InvalidHeader(b'x')));
        assert!(matches!(s.push(b"{1}"), Err(FrameError::InvalidJson(_))));
        assert_eq!(s.push(br#"{"ok":true}"#).unwrap(), vec![json!({"ok": true})]);

        let mut s = Splitter::new(8);
        assert!(matches!(s.push(br#"{"long":"value"}"#), Err(FrameError::TooLarge(9, 8))));
    }
}
