use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// One dispatched server-sent event. Multi-line `data:` fields are joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("stream ended inside an unterminated event ({bytes} bytes dropped)")]
    Truncated { bytes: usize },
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Incremental `text/event-stream` decoder. Bytes arrive in arbitrary chunks;
/// an event is dispatched on each blank line.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    data: Vec<u8>,
    has_data: bool,
    frame_bytes: usize,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            data: Vec::new(),
            has_data: false,
            frame_bytes: 0,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if !self.pending.is_empty() && self.pending.len() > self.max_frame_bytes {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.reset_frame();
        }

        report
    }

    /// End of stream. An event without its terminating blank line is incomplete
    /// and is dropped, never dispatched.
    pub fn finish(&mut self) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        let bytes = self.pending.len() + if self.has_data { self.frame_bytes } else { 0 };
        if bytes > 0 {
            report.push_error(FrameError::Truncated { bytes });
        }
        self.pending.clear();
        self.reset_frame();
        report
    }

    fn process_line(&mut self, line: &[u8], report: &mut DecodeReport<SseFrame>) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        if line[0] == b':' {
            return;
        }

        let (field, value) = match line.iter().position(|byte| *byte == b':') {
            Some(idx) => {
                let mut value = &line[idx + 1..];
                if value.first() == Some(&b' ') {
                    value = &value[1..];
                }
                (&line[..idx], value)
            }
            None => (line, &b""[..]),
        };

        match field {
            b"data" => {
                let continued = self.has_data;
                self.has_data = true;
                self.frame_bytes += value.len() + usize::from(continued);
                if self.frame_bytes > self.max_frame_bytes {
                    self.data.clear();
                    return;
                }
                if continued {
                    self.data.push(b'\n');
                }
                self.data.extend_from_slice(value);
            }
            // event, id, retry: the payload's own `type` drives decoding
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<SseFrame>) {
        if !self.has_data {
            self.reset_frame();
            return;
        }
        if self.frame_bytes > self.max_frame_bytes {
            report.push_error(FrameError::OversizedFrame {
                size: self.frame_bytes,
                max: self.max_frame_bytes,
            });
            self.reset_frame();
            return;
        }
        let data = std::mem::take(&mut self.data);
        match String::from_utf8(data) {
            Ok(data) => report.push_frame(SseFrame { data }),
            Err(err) => report.push_error(FrameError::Decode(err.to_string())),
        }
        self.reset_frame();
    }

    fn reset_frame(&mut self) {
        self.data.clear();
        self.has_data = false;
        self.frame_bytes = 0;
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
