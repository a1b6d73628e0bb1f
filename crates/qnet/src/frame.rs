use std::mem;

use thiserror::Error;

/// Marker expected at the start of every framed message.
pub const FRAME_FLAG: u32 = 0x5151_5151;
/// Wire header: flag, payload size, reserved checksum. Network byte order.
pub const HEADER_SIZE: usize = 12;
/// Largest payload a single framed message may carry.
pub const MAX_STREAM_PAYLOAD: usize = 16 * 1024 * 1024;

/// Wire-format violation. The owning connection must be torn down; the
/// framer refuses further input once it has reported one of these.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame flag {0:#010x}")]
    Flag(u32),
    #[error("frame size {0} out of range")]
    Size(u32),
}

/// Decoded fixed-size header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) size: u32,
}

impl FrameHeader {
    /// Encodes a send-side header. The checksum word is reserved and
    /// transmitted as zero.
    pub(crate) fn encode(size: u32) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&FRAME_FLAG.to_be_bytes());
        raw[4..8].copy_from_slice(&size.to_be_bytes());
        raw
    }

    /// The checksum word is not verified on receive.
    fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self, FrameError> {
        let flag = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        if flag != FRAME_FLAG {
            return Err(FrameError::Flag(flag));
        }
        let size = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        if size == 0 || size as usize > MAX_STREAM_PAYLOAD {
            return Err(FrameError::Size(size));
        }
        Ok(Self { size })
    }
}

/// One reassembled message.
///
/// A body that arrived whole inside a single receive chunk borrows the
/// chunk; a body that spanned chunks owns its reassembly buffer. Callers
/// must consume borrowed packets before the receive buffer is reused,
/// which the dispatch path guarantees by delivering packets inside the
/// completion handler.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl Packet<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Packet::Borrowed(b) => b,
            Packet::Owned(v) => v,
        }
    }
}

/// Body reassembly in progress. `buf` stays empty until the first partial
/// copy is needed; a body satisfied entirely by one chunk never touches it.
#[derive(Debug, Default)]
struct Body {
    total: usize,
    written: usize,
    buf: Vec<u8>,
}

/// Receive-side framing state machine.
///
/// Feed arbitrary byte chunks in arrival order; complete messages come out
/// in wire order. Chunk boundaries are invisible: any split of a valid
/// stream yields the same packet sequence as feeding it whole.
#[derive(Debug, Default)]
pub(crate) struct Framer {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    body: Option<Body>,
    failed: Option<FrameError>,
}

impl Framer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Consumes one chunk, appending every message it completes to `out`.
    pub(crate) fn push<'a>(
        &mut self,
        chunk: &'a [u8],
        out: &mut Vec<Packet<'a>>,
    ) -> Result<(), FrameError> {
        if let Some(err) = self.failed {
            return Err(err);
        }
        let mut rest = chunk;
        while !rest.is_empty() {
            let Some(body) = self.body.as_mut() else {
                let take = (HEADER_SIZE - self.header_len).min(rest.len());
                self.header[self.header_len..self.header_len + take]
                    .copy_from_slice(&rest[..take]);
                self.header_len += take;
                rest = &rest[take..];
                if self.header_len < HEADER_SIZE {
                    break;
                }
                match FrameHeader::decode(&self.header) {
                    Ok(head) => {
                        self.body =
                            Some(Body { total: head.size as usize, written: 0, buf: Vec::new() });
                        continue;
                    }
                    Err(err) => {
                        self.failed = Some(err);
                        return Err(err);
                    }
                }
            };
            let total = body.total;
            if body.written == 0 && rest.len() >= total {
                out.push(Packet::Borrowed(&rest[..total]));
                rest = &rest[total..];
                self.reset();
                continue;
            }
            if body.buf.capacity() == 0 {
                body.buf.reserve_exact(total);
            }
            let take = (total - body.written).min(rest.len());
            body.buf.extend_from_slice(&rest[..take]);
            body.written += take;
            rest = &rest[take..];
            if body.written == total {
                let buf = mem::take(&mut body.buf);
                out.push(Packet::Owned(buf));
                self.reset();
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.header_len = 0;
        self.body = None;
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;

    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = FrameHeader::encode(payload.len() as u32).to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn feed_all(framer: &mut Framer, stream: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        framer.push(stream, &mut out).unwrap();
        out.iter().map(|p| p.as_slice().to_vec()).collect()
    }

    #[test]
    fn single_message_round_trip() {
        let stream = frame(b"hello");
        let mut framer = Framer::new();
        assert_eq!(feed_all(&mut framer, &stream), vec![b"hello".to_vec()]);
    }

    #[test]
    fn whole_body_in_one_chunk_borrows() {
        let stream = frame(b"zero-copy");
        let mut framer = Framer::new();
        let mut out = Vec::new();
        framer.push(&stream, &mut out).unwrap();
        assert!(matches!(out[0], Packet::Borrowed(_)));
        assert_eq!(out[0].as_slice(), b"zero-copy");
    }

    #[test]
    fn split_body_is_owned() {
        let stream = frame(b"spanning");
        let mut framer = Framer::new();
        let mut out = Vec::new();
        framer.push(&stream[..HEADER_SIZE + 3], &mut out).unwrap();
        assert!(out.is_empty());
        framer.push(&stream[HEADER_SIZE + 3..], &mut out).unwrap();
        assert!(matches!(out[0], Packet::Owned(_)));
        assert_eq!(out[0].as_slice(), b"spanning");
    }

    #[test]
    fn any_chunking_yields_the_same_messages() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![0xAB; 1],
            (0..200u16).map(|b| b as u8).collect(),
            vec![7; 5000],
            vec![1; 13],
        ];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&frame(p));
        }

        let mut whole = Framer::new();
        let expected = feed_all(&mut whole, &stream);
        assert_eq!(expected, payloads);

        let mut rng = StdRng::seed_from_u64(0x51515151);
        for _ in 0..200 {
            let mut framer = Framer::new();
            let mut got = Vec::new();
            let mut rest = &stream[..];
            while !rest.is_empty() {
                let take = rng.random_range(1..=rest.len().min(97));
                let mut out = Vec::new();
                framer.push(&rest[..take], &mut out).unwrap();
                got.extend(out.iter().map(|p| p.as_slice().to_vec()));
                rest = &rest[take..];
            }
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn bad_flag_fails_when_the_header_completes() {
        let mut stream = frame(b"abcde");
        stream[0] = 0;
        let mut framer = Framer::new();
        let mut out = Vec::new();
        // Error surfaces on the chunk that finishes the header, not before.
        framer.push(&stream[..HEADER_SIZE - 1], &mut out).unwrap();
        let err = framer.push(&stream[HEADER_SIZE - 1..], &mut out).unwrap_err();
        assert!(matches!(err, FrameError::Flag(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn oversized_and_zero_sizes_are_rejected() {
        for size in [0u32, (MAX_STREAM_PAYLOAD as u32) + 1, 17 * 1024 * 1024] {
            let head = FrameHeader::encode(size);
            let mut framer = Framer::new();
            let mut out = Vec::new();
            let err = framer.push(&head, &mut out).unwrap_err();
            assert!(matches!(err, FrameError::Size(s) if s == size));
        }
        // Exactly 16 MiB is still legal.
        let head = FrameHeader::encode(MAX_STREAM_PAYLOAD as u32);
        let mut framer = Framer::new();
        let mut out = Vec::new();
        framer.push(&head, &mut out).unwrap();
    }

    #[test]
    fn no_messages_after_a_failure() {
        let mut stream = frame(b"abcde");
        stream[0] = 0;
        let mut framer = Framer::new();
        let mut out = Vec::new();
        assert!(framer.push(&stream, &mut out).is_err());
        // Even a well-formed follow-up chunk must not produce output.
        let good = frame(b"later");
        assert!(framer.push(&good, &mut out).is_err());
        assert!(out.is_empty());
    }
}
