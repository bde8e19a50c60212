use bytes::Bytes;

pub const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_DATA
    }

    pub fn to_bytes(&self) -> Bytes {
        encode_frame(self.event.as_deref(), &self.data)
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte chars
/// split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(line.as_str());
            self.feed_line(line, &mut frames);
        }

        frames
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(line.as_str());
            self.feed_line(line, &mut frames);
        }
        self.flush(&mut frames);
        frames
    }

    fn feed_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

pub fn encode_frame(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 16);
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn encode_json<T: serde::Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(value)?;
    Ok(encode_frame(None, &data))
}

pub fn done_frame() -> Bytes {
    encode_frame(None, DONE_DATA)
}
