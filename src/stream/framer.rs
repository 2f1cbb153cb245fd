//! Incremental decoder for text event streams.
//!
//! Frames are blocks of `event:` / `data:` lines separated by a blank line.
//! The decoder buffers raw bytes until a block boundary arrives, so chunk
//! boundaries carry no meaning: a chunk may hold zero, one or many frames, and
//! one frame may straddle any number of chunks.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::Stream;

/// Event name used when a block carries no `event:` line.
pub const DEFAULT_EVENT_NAME: &str = "message";

const EVENT_PREFIX: &str = "event:";
const DATA_PREFIX: &str = "data:";
const BLOCK_BOUNDARY: &[u8] = b"\n\n";

/// One decoded event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Event name, `"message"` when the block had none.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// Returns `true` when the frame carries the given event name.
    pub fn is(&self, event: &str) -> bool {
        self.event == event
    }
}

/// Push-style frame decoder holding the undecoded tail of one stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    // Offset up to which `buf` is known to hold no boundary.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame it completed, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = VecDeque::new();
        self.decode_into(chunk, &mut frames);
        frames.into()
    }

    /// Appends a chunk and pushes every completed frame onto `out`.
    pub fn decode_into(&mut self, chunk: &[u8], out: &mut VecDeque<Frame>) {
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = find_boundary(&self.buf[search_from..]) {
            let end = search_from + offset;
            if let Some(frame) = parse_block(&self.buf[consumed..end]) {
                out.push_back(frame);
            }
            consumed = end + BLOCK_BOUNDARY.len();
            search_from = consumed;
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        // A boundary may begin on the last byte kept, so rescan it next time.
        self.scanned = self.buf.len().saturating_sub(BLOCK_BOUNDARY.len() - 1);
    }

    /// Number of buffered bytes not yet forming a complete block.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Drops the incomplete tail.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(BLOCK_BOUNDARY.len())
        .position(|window| window == BLOCK_BOUNDARY)
}

fn parse_block(block: &[u8]) -> Option<Frame> {
    if block.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(block);
    let mut event: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if let Some(rest) = line.strip_prefix(EVENT_PREFIX) {
            event = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    let event = match event {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_EVENT_NAME,
    };
    Some(Frame::new(event, data_lines.join("\n")))
}

/// Lazy frame sequence over a chunk stream.
///
/// Yields frames in arrival order. A chunk error is yielded once, after every
/// frame decoded before it, and ends the sequence. An incomplete tail left
/// when the chunk stream completes is discarded.
pub struct FrameStream<S> {
    chunks: S,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    finished: bool,
}

impl<S> FrameStream<S> {
    pub fn new(chunks: S) -> Self {
        Self {
            chunks,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Bytes buffered but not yet decoded into a frame.
    pub fn pending_len(&self) -> usize {
        self.decoder.pending_len()
    }
}

impl<S> fmt::Debug for FrameStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("decoder", &self.decoder)
            .field("ready", &self.ready.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    type Item = Result<Frame, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.chunks).poll_next(cx)) {
                Some(Ok(chunk)) => this.decoder.decode_into(chunk.as_ref(), &mut this.ready),
                Some(Err(err)) => {
                    this.finished = true;
                    this.decoder.clear();
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    this.finished = true;
                    this.decoder.clear();
                }
            }
        }
    }
}

/// Wraps a chunk stream into a lazy frame sequence.
pub fn frames<S>(chunks: S) -> FrameStream<S> {
    FrameStream::new(chunks)
}

#[cfg(test)]
mod tests {
    use futures_util::{stream, StreamExt};

    use super::{frames, Frame, FrameDecoder, DEFAULT_EVENT_NAME};

    const TWO_TOKENS: &str = "event: token\ndata: A\n\nevent: token\ndata: B\n\n";

    fn decode_split(input: &[u8], cuts: &[usize]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        let mut start = 0;
        let end = [input.len()];
        for &cut in cuts.iter().chain(end.iter()) {
            out.extend(decoder.push_chunk(&input[start..cut]));
            start = cut;
        }
        out
    }

    #[test]
    fn decodes_two_token_frames_in_order() {
        let frames = decode_split(TWO_TOKENS.as_bytes(), &[]);
        assert_eq!(
            frames,
            vec![Frame::new("token", "A"), Frame::new("token", "B")]
        );
    }

    #[test]
    fn every_two_way_and_three_way_split_decodes_identically() {
        let input = TWO_TOKENS.as_bytes();
        let expected = decode_split(input, &[]);
        for first in 0..=input.len() {
            assert_eq!(decode_split(input, &[first]), expected, "cut at {first}");
            for second in first..=input.len() {
                assert_eq!(
                    decode_split(input, &[first, second]),
                    expected,
                    "cuts at {first},{second}"
                );
            }
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole_input() {
        let input = "event: sources\ndata: [1,\ndata: 2]\n\n: comment\n\ndata: tail\n\n";
        let cuts: Vec<usize> = (1..input.len()).collect();
        assert_eq!(
            decode_split(input.as_bytes(), &cuts),
            decode_split(input.as_bytes(), &[])
        );
    }

    #[test]
    fn joins_multiple_data_lines_with_newline() {
        let frames = decode_split(b"data: line1\ndata: line2\n\n", &[]);
        assert_eq!(frames, vec![Frame::new(DEFAULT_EVENT_NAME, "line1\nline2")]);
    }

    #[test]
    fn event_only_block_yields_no_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_chunk(b"event: heartbeat\n\n").is_empty());
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn strips_only_one_leading_space_after_data_marker() {
        let frames = decode_split(b"data:  indented\ndata:tight\n\n", &[]);
        assert_eq!(frames[0].data, " indented\ntight");
    }

    #[test]
    fn ignores_unknown_prefixes() {
        let frames = decode_split(b"id: 7\nretry: 100\n: note\nevent: done\ndata: ok\n\n", &[]);
        assert_eq!(frames, vec![Frame::new("done", "ok")]);
    }

    #[test]
    fn empty_data_line_still_yields_frame() {
        let frames = decode_split(b"event: done\ndata:\n\n", &[]);
        assert_eq!(frames, vec![Frame::new("done", "")]);
    }

    #[test]
    fn keeps_incomplete_tail_only() {
        let mut decoder = FrameDecoder::new();
        let out = decoder.push_chunk(b"data: one\n\ndata: tw");
        assert_eq!(out, vec![Frame::new(DEFAULT_EVENT_NAME, "one")]);
        assert_eq!(decoder.pending_len(), "data: tw".len());
        let out = decoder.push_chunk(b"o\n");
        assert!(out.is_empty());
        let out = decoder.push_chunk(b"\n");
        assert_eq!(out, vec![Frame::new(DEFAULT_EVENT_NAME, "two")]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let input = "event: token\ndata: héllo ✓\n\n".as_bytes();
        let check = input.iter().position(|&b| b == 0xE2).expect("check mark");
        let frames = decode_split(input, &[check + 1]);
        assert_eq!(frames, vec![Frame::new("token", "héllo ✓")]);
    }

    #[test]
    fn tolerates_carriage_returns_before_newlines() {
        let frames = decode_split(b"event: token\r\ndata: A\r\n\n", &[]);
        assert_eq!(frames, vec![Frame::new("token", "A")]);
    }

    #[test]
    fn debug_output_does_not_require_debug_chunks() {
        let stream = frames(stream::empty::<Result<Vec<u8>, ()>>().boxed());
        let rendered = format!("{stream:?}");
        assert!(rendered.starts_with("FrameStream"));
        assert!(!rendered.contains("chunks"));
    }

    #[tokio::test]
    async fn stream_discards_partial_tail_at_completion() {
        let chunks = stream::iter(vec![
            Ok::<_, &str>("data: a\n\n".as_bytes()),
            Ok("data: partial".as_bytes()),
        ]);
        let decoded: Vec<_> = frames(chunks).collect().await;
        assert_eq!(decoded, vec![Ok(Frame::new(DEFAULT_EVENT_NAME, "a"))]);
    }

    #[tokio::test]
    async fn stream_yields_decoded_frames_before_chunk_error_then_ends() {
        let chunks = stream::iter(vec![
            Ok("data: a\n\ndata: b\n\ndata: c".as_bytes()),
            Err("reset"),
            Ok("\n\ndata: d\n\n".as_bytes()),
        ]);
        let decoded: Vec<_> = frames(chunks).collect().await;
        assert_eq!(
            decoded,
            vec![
                Ok(Frame::new(DEFAULT_EVENT_NAME, "a")),
                Ok(Frame::new(DEFAULT_EVENT_NAME, "b")),
                Err("reset"),
            ]
        );
    }
}
