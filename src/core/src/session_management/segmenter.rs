//! Command segmentation of an interactive byte stream.
//!
//! The segmenter watches both directions of the backend link. Operator bytes travelling to
//! the backend decide the phase: a submit marker ends the input phase, anything else after
//! a submission closes the pending command. Backend bytes are buffered into the current
//! phase: the echo of what is typed lands in the input buffer, the command output in the
//! output buffer.

use std::sync::Arc;

use crate::data_capture::TtyParser;

/// Zmodem upload header; a span starting with it is a file transfer, not a command.
pub const DEFAULT_RZ_MARKER: &[u8] = b"**\x18B0900000000000000\r\x8a\x11";

/// A finished command span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub input: String,
    pub output: String,
}

/// Append-only chunk list that never holds more than `budget` bytes.
#[derive(Debug)]
struct SizedBuffer {
    chunks: Vec<Vec<u8>>,
    size: usize,
    budget: usize,
}

impl SizedBuffer {
    fn new(budget: usize) -> Self {
        Self {
            chunks: Vec::new(),
            size: 0,
            budget,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.budget.saturating_sub(self.size);
        let take = room.min(chunk.len());
        if take == 0 {
            return;
        }
        self.chunks.push(chunk[..take].to_vec());
        self.size += take;
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}

pub struct Segmenter {
    submit_markers: Vec<Vec<u8>>,
    rz_marker: Vec<u8>,
    parser: Arc<dyn TtyParser>,
    input_data: SizedBuffer,
    output_data: SizedBuffer,
    input: Option<String>,
    in_input_state: bool,
    input_initialized: bool,
}

impl Segmenter {
    pub fn new(
        parser: Arc<dyn TtyParser>,
        submit_markers: Vec<Vec<u8>>,
        rz_marker: Option<Vec<u8>>,
        budget: usize,
    ) -> Self {
        Self {
            submit_markers: submit_markers.into_iter().filter(|m| !m.is_empty()).collect(),
            rz_marker: rz_marker.unwrap_or_else(|| DEFAULT_RZ_MARKER.to_vec()),
            parser,
            input_data: SizedBuffer::new(budget),
            output_data: SizedBuffer::new(budget),
            input: None,
            in_input_state: true,
            input_initialized: false,
        }
    }

    fn is_submit(&self, chunk: &[u8]) -> bool {
        self.submit_markers
            .iter()
            .any(|marker| chunk.windows(marker.len()).any(|w| w == marker.as_slice()))
    }

    fn parse_input(&self) -> Option<String> {
        let first = self.input_data.chunks.first()?;
        if *first == self.rz_marker {
            return None;
        }
        Some(self.parser.parse_input(&self.input_data.chunks))
    }

    /// Feeds operator bytes about to be sent to the backend.
    ///
    /// Returns the command closed by this chunk, if any.
    pub fn on_outbound(&mut self, chunk: &[u8]) -> Option<Segment> {
        self.input_initialized = true;

        if self.is_submit(chunk) {
            self.in_input_state = false;
            self.input = self.parse_input();
            return None;
        }

        let mut segment = None;
        if !self.in_input_state {
            let output = self.parser.parse_output(&self.output_data.chunks);
            if let Some(input) = self.input.take().filter(|i| !i.is_empty()) {
                segment = Some(Segment { input, output });
            }
            self.input_data.clear();
            self.output_data.clear();
        }
        self.in_input_state = true;
        segment
    }

    /// Feeds bytes received from the backend.
    pub fn on_inbound(&mut self, chunk: &[u8]) {
        if !self.input_initialized {
            return;
        }
        if self.in_input_state {
            self.input_data.push(chunk);
        } else {
            self.output_data.push(chunk);
        }
    }

    /// Closes whatever span is pending, used when the backend link closes.
    pub fn finish(&mut self) -> Option<Segment> {
        self.on_outbound(b"")
    }

    pub fn buffered(&self) -> (usize, usize) {
        (self.input_data.size, self.output_data.size)
    }
}
