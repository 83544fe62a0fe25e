//! Incremental `text/event-stream` parser.

use tracing::warn;

/// A parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type, `message` unless the stream names one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Last event id, if sent.
    pub id: Option<String>,
}

impl Default for SseEvent {
    fn default() -> Self {
        Self {
            event: "message".to_owned(),
            data: String::new(),
            id: None,
        }
    }
}

/// Parser state carried across chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    /// Bytes of a UTF-8 sequence cut off by the end of the last chunk.
    utf8_tail: Vec<u8>,
    current: SseEvent,
    has_data: bool,
}

impl SseParser {
    /// Creates a parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => value.clone_into(&mut self.current.event),
            "data" => {
                self.current.data.push_str(value);
                self.current.data.push('\n');
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.current.id = Some(value.to_owned()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if !self.has_data {
            self.current = SseEvent::default();
            return None;
        }
        let mut event = std::mem::take(&mut self.current);
        if event.data.ends_with('\n') {
            event.data.pop();
        }
        if event.event.is_empty() {
            "message".clone_into(&mut event.event);
        }
        self.has_data = false;
        Some(event)
    }

    /// Feeds a chunk of the byte stream and returns the events it completes.
    ///
    /// A multi-byte character split across chunks is held back until the
    /// rest of it arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.utf8_tail.extend_from_slice(chunk);
        let mut pending = std::mem::take(&mut self.utf8_tail);
        let mut text = String::with_capacity(pending.len());

        loop {
            match std::str::from_utf8(&pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    text.push_str(std::str::from_utf8(&pending[..valid_len]).unwrap_or_default());
                    match err.error_len() {
                        Some(invalid_len) => {
                            warn!(invalid_len, "replacing invalid UTF-8 in event stream");
                            text.push(char::REPLACEMENT_CHARACTER);
                            pending.drain(..valid_len + invalid_len);
                        }
                        None => {
                            pending.drain(..valid_len);
                            break;
                        }
                    }
                }
            }
        }

        self.utf8_tail = pending;
        self.feed_text(&text)
    }

    fn feed_text(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find(['\n', '\r']) {
            let is_cr = self.buffer.as_bytes()[pos] == b'\r';
            if is_cr && pos + 1 == self.buffer.len() {
                // Wait for the next chunk to see whether this is CRLF.
                break;
            }
            let skip = if is_cr && self.buffer.as_bytes()[pos + 1] == b'\n' {
                2
            } else {
                1
            };
            let line: String = self.buffer[..pos].to_owned();
            self.buffer.drain(..pos + skip);

            if line.is_empty() {
                events.extend(self.dispatch());
            } else {
                self.process_line(&line);
            }
        }

        events
    }

    /// Flushes a trailing event when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            warn!(bytes = tail.len(), "event stream ended inside a UTF-8 sequence");
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }
}
