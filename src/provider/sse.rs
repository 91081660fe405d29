//! Line-buffered decoding of OpenAI-compatible SSE chat streams.
//!
//! Reassembles `data:` lines across TCP chunk boundaries and extracts the
//! `choices[0].delta.content` text of each event.

/// Longest line accepted without a newline. Some local servers send a whole
/// reply as one delta, so this is generous; past it the stream fails.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// One decoded item from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseItem {
    /// Non-empty content delta.
    Delta(String),
    /// The provider reported an error inside the stream.
    Error(String),
}

pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    /// An oversized line was hit; nothing more is decoded.
    overflowed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            done: false,
            overflowed: false,
        }
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of bytes, returning every item completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        let mut items = Vec::new();
        if self.done || self.overflowed {
            return items;
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line, &mut items);
            if self.done {
                self.buffer.clear();
                return items;
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = MAX_LINE_BYTES,
                "SSE line exceeded buffer cap, failing stream"
            );
            self.buffer = Vec::new();
            self.overflowed = true;
            items.push(SseItem::Error(format!(
                "SSE line exceeds {} KiB",
                MAX_LINE_BYTES / 1024
            )));
        }

        items
    }

    /// Flush a trailing line that arrived without a newline.
    pub fn finish(&mut self) -> Vec<SseItem> {
        let mut items = Vec::new();
        if !self.done && !self.overflowed && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, &mut items);
        }
        items
    }

    fn process_line(&mut self, raw: &[u8], items: &mut Vec<SseItem>) {
        let Ok(line) = std::str::from_utf8(raw) else {
            tracing::debug!("skipping non-UTF-8 SSE line");
            return;
        };
        let line = line.trim_end_matches(['\r', '\n']);

        // Only data lines carry payload; event:, id:, retry: and comments are ignored.
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);

        if data == "[DONE]" {
            self.done = true;
            return;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            tracing::debug!(data = %data, "skipping malformed SSE payload");
            return;
        };

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            items.push(SseItem::Error(message));
            return;
        }

        let content = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str());

        if let Some(text) = content.filter(|t| !t.is_empty()) {
            items.push(SseItem::Delta(text.to_string()));
        }
    }
}
