//! Reassembly of protocol frames from notification chunks.
//!
//! The BMS pushes a frame over several BLE notifications, and notification
//! boundaries have no relationship to frame boundaries. A frame starts with
//! [`START_MARKER`] and ends at the first [`END_MARKER`] byte after it. There is
//! no length field or escaping, so a payload byte equal to the end marker ends
//! the frame early. That is how the device firmware frames its output and has
//! to be matched.

use tracing::{debug, trace, warn};

/// The two bytes that open every frame.
pub const START_MARKER: [u8; 2] = [0x7E, 0xA1];

/// The byte that closes every frame.
pub const END_MARKER: u8 = 0x55;

/// Default upper bound on the size of a frame in progress.
///
/// A status frame with 255 cells and 255 temperature sensors is a little over
/// 1 KiB, so anything past this is a lost end marker.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// One fully delimited frame, start marker through end marker inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteFrame(Vec<u8>);

impl CompleteFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl AsRef<[u8]> for CompleteFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Counters describing what the assembler has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    /// Frames emitted.
    pub frames_emitted: u64,
    /// Frames in progress that were thrown away, either because a new start
    /// marker arrived first or because they outgrew the size limit.
    pub partial_frames_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No frame has started. The buffer holds at most one byte, in case it is
    /// the first half of a start marker split across chunks.
    Idle,
    /// The buffer holds a frame in progress, beginning with the start marker.
    Accumulating,
}

/// Turns chunks into complete frames.
///
/// Bytes are processed one at a time, so the way a stream is cut into chunks
/// never changes which frames come out. Each connection needs its own
/// assembler. Callers that receive chunks on more than one thread must
/// serialize calls to [`FrameAssembler::push`], for example behind a mutex.
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    state: State,
    max_frame_len: usize,
    stats: AssemblerStats,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create an assembler that gives up on frames longer than `max_frame_len` bytes.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            state: State::Idle,
            max_frame_len: max_frame_len.max(START_MARKER.len() + 1),
            stats: AssemblerStats::default(),
        }
    }

    /// Feed one chunk and collect every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CompleteFrame> {
        trace!(chunk = %hex::encode(chunk), "rx chunk");
        chunk.iter().filter_map(|&byte| self.push_byte(byte)).collect()
    }

    /// Feed a single byte, returning the frame it completes if any.
    pub fn push_byte(&mut self, byte: u8) -> Option<CompleteFrame> {
        self.buffer.push(byte);

        if self.buffer.ends_with(&START_MARKER) {
            self.start_frame();
            return None;
        }

        match self.state {
            State::Idle => {
                if self.buffer.len() > 1 {
                    self.buffer.remove(0);
                }
                None
            }
            State::Accumulating if byte == END_MARKER => {
                self.state = State::Idle;
                self.stats.frames_emitted += 1;
                let frame = CompleteFrame(std::mem::take(&mut self.buffer));
                debug!(len = frame.len(), "frame complete");
                Some(frame)
            }
            State::Accumulating => {
                if self.buffer.len() > self.max_frame_len {
                    warn!(
                        len = self.buffer.len(),
                        max = self.max_frame_len,
                        "frame exceeds size limit, discarding"
                    );
                    self.stats.partial_frames_dropped += 1;
                    self.reset();
                    // Keep a possible first half of the next start marker
                    if byte == START_MARKER[0] {
                        self.buffer.push(byte);
                    }
                }
                None
            }
        }
    }

    /// Discard any buffered bytes and wait for the next start marker.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::Idle;
    }

    /// Whether a frame is in progress.
    pub fn is_accumulating(&self) -> bool {
        self.state == State::Accumulating
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Restart the buffer at the start marker that now ends it.
    fn start_frame(&mut self) {
        let discarded = self.buffer.len() - START_MARKER.len();
        if self.state == State::Accumulating {
            debug!(discarded, "start marker inside frame, restarting");
            self.stats.partial_frames_dropped += 1;
        }
        self.buffer.drain(..discarded);
        self.state = State::Accumulating;
    }
}

#[cfg(test)]
use crate::test_utils::StatusFrameBuilder;
#[cfg(test)]
use proptest::prelude::*;

#[cfg(test)]
fn collect(assembler: &mut FrameAssembler, chunks: &[&[u8]]) -> Vec<CompleteFrame> {
    chunks.iter().flat_map(|chunk| assembler.push(chunk)).collect()
}

#[test]
fn test_single_chunk_frame() {
    let frame = StatusFrameBuilder::default().build();
    let mut assembler = FrameAssembler::new();

    let frames = assembler.push(&frame);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_bytes(), &frame[..]);
    assert!(!assembler.is_accumulating());
    assert_eq!(assembler.buffered_len(), 0);
}

#[test]
fn test_every_split_point() {
    let frame = StatusFrameBuilder::default().build();
    for split in 0..=frame.len() {
        let mut assembler = FrameAssembler::new();
        let frames = collect(&mut assembler, &[&frame[..split], &frame[split..]]);
        assert_eq!(frames.len(), 1, "split at {split}");
        assert_eq!(frames[0].as_bytes(), &frame[..], "split at {split}");
    }
}

#[test]
fn test_single_byte_chunks() {
    let frame = StatusFrameBuilder::default().build();
    let mut assembler = FrameAssembler::new();

    let frames: Vec<_> = frame.chunks(1).flat_map(|c| assembler.push(c)).collect();

    assert_eq!(frames, vec![CompleteFrame(frame)]);
}

#[test]
fn test_two_frames_in_one_chunk() {
    let first = StatusFrameBuilder::default().build();
    let second = StatusFrameBuilder::default().soc_pct(42).build();
    let mut wire = first.clone();
    wire.extend_from_slice(&second);

    let frames = FrameAssembler::new().push(&wire);

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].as_bytes(), &first[..]);
    assert_eq!(frames[1].as_bytes(), &second[..]);
}

#[test]
fn test_spurious_start_marker_restarts() {
    let frame = StatusFrameBuilder::default().build();
    let mut assembler = FrameAssembler::new();

    // A frame that loses its tail, followed by a complete one.
    let frames = collect(&mut assembler, &[&frame[..20], &frame]);

    assert_eq!(frames, vec![CompleteFrame(frame)]);
    assert_eq!(assembler.stats().partial_frames_dropped, 1);
    assert_eq!(assembler.stats().frames_emitted, 1);
}

#[test]
fn test_start_marker_split_across_chunks() {
    let frame = StatusFrameBuilder::default().build();
    let mut assembler = FrameAssembler::new();

    let frames = collect(&mut assembler, &[&[0x01, 0x02, 0x7E], &frame[1..]]);

    assert_eq!(frames, vec![CompleteFrame(frame)]);
}

#[test]
fn test_leading_noise_discarded() {
    let frame = StatusFrameBuilder::default().build();
    let mut noisy = hex::decode("0055aa7e55").unwrap();
    noisy.extend_from_slice(&frame);

    let frames = FrameAssembler::new().push(&noisy);

    assert_eq!(frames, vec![CompleteFrame(frame)]);
}

#[test]
fn test_end_marker_without_start_is_ignored() {
    let mut assembler = FrameAssembler::new();
    assert!(assembler.push(&[0x55, 0x55, 0x01, 0x55]).is_empty());
    assert!(!assembler.is_accumulating());
}

#[test]
fn test_end_marker_in_payload_terminates_early() {
    let mut assembler = FrameAssembler::new();
    let frames = assembler.push(&[0x7E, 0xA1, 0x11, 0x55, 0x02, 0x55]);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_bytes(), &[0x7E, 0xA1, 0x11, 0x55]);
    // The remainder is outside any frame and is dropped.
    assert!(!assembler.is_accumulating());
}

#[test]
fn test_empty_chunk() {
    let mut assembler = FrameAssembler::new();
    assert!(assembler.push(&[]).is_empty());
    assert_eq!(assembler.buffered_len(), 0);
}

#[test]
fn test_oversized_frame_discarded() {
    let mut assembler = FrameAssembler::with_max_frame_len(16);
    assert!(assembler.push(&[0x7E, 0xA1]).is_empty());
    assert!(assembler.push(&[0x00; 32]).is_empty());
    assert!(!assembler.is_accumulating());
    assert_eq!(assembler.stats().partial_frames_dropped, 1);

    let frames = assembler.push(&[0x7E, 0xA1, 0x11, 0x55]);
    assert_eq!(frames.len(), 1);
}

#[test]
fn test_start_marker_kept_across_size_limit() {
    let mut assembler = FrameAssembler::with_max_frame_len(16);
    let mut wire = vec![0x7E, 0xA1];
    wire.extend_from_slice(&[0x00; 14]);
    // 0x7E is the byte that overflows the limit
    wire.extend_from_slice(&[0x7E, 0xA1, 0x11, 0x00, 0x55]);

    let frames = assembler.push(&wire);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_bytes(), &[0x7E, 0xA1, 0x11, 0x00, 0x55]);
    assert_eq!(assembler.stats().partial_frames_dropped, 1);
}

#[test]
fn test_reset_drops_partial_frame() {
    let frame = StatusFrameBuilder::default().build();
    let mut assembler = FrameAssembler::new();
    assembler.push(&frame[..12]);
    assert!(assembler.is_accumulating());

    assembler.reset();

    assert!(!assembler.is_accumulating());
    assert!(assembler.push(&frame[12..]).is_empty());
}

#[cfg(test)]
proptest! {
    #[test]
    fn prop_arbitrary_chunking_yields_same_frames(
        cuts in proptest::collection::vec(0usize..200, 0..12)
    ) {
        let first = StatusFrameBuilder::default().build();
        let second = StatusFrameBuilder::default().cells(&[3301, 3302]).build();
        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (wire.len() + 1)).collect();
        cuts.sort_unstable();

        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        let mut prev = 0;
        for cut in cuts.into_iter().chain(std::iter::once(wire.len())) {
            frames.extend(assembler.push(&wire[prev..cut]));
            prev = cut;
        }

        prop_assert_eq!(frames, vec![CompleteFrame(first), CompleteFrame(second)]);
    }

    #[test]
    fn prop_never_panics_on_noise(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..64), 0..16)
    ) {
        let mut assembler = FrameAssembler::with_max_frame_len(128);
        for chunk in &chunks {
            for frame in assembler.push(chunk) {
                prop_assert!(frame.as_bytes().starts_with(&START_MARKER));
                prop_assert_eq!(frame.as_bytes().last(), Some(&END_MARKER));
            }
            prop_assert!(assembler.buffered_len() <= 128);
        }
    }
}
