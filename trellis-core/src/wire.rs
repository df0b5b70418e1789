//! Resumable frame codec: big-endian fields decoded from a streaming
//! buffer, one field at a time, tolerant of arbitrary fragmentation.
//!
//! Each reader consumes bytes from the front of a caller-supplied slice
//! (advancing it) and reports a [`ReadStatus`]. Bytes for one field may
//! arrive across any number of `feed` calls, including one byte at a time;
//! partial bytes are retained between calls and never re-read.

use crate::protocol::{
    AddressFrame, Frame, WorkFrame, KIND_ADDRESS, KIND_WORK, MAX_STRING_LEN,
};

/// Outcome of feeding bytes to a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The value is not complete yet; feed again once more bytes arrive.
    NeedMore,
    /// A complete value is ready.
    Done,
    /// The stream violates the protocol; the connection must close.
    Malformed,
}

/// Reads one big-endian u32, accumulated across any number of feeds.
#[derive(Debug, Default)]
pub struct U32Reader {
    buf: [u8; 4],
    filled: usize,
}

impl U32Reader {
    pub fn feed(&mut self, input: &mut &[u8]) -> ReadStatus {
        if self.filled < 4 {
            let take = (4 - self.filled).min(input.len());
            self.buf[self.filled..self.filled + take].copy_from_slice(&input[..take]);
            self.filled += take;
            *input = &input[take..];
        }
        if self.filled < 4 {
            ReadStatus::NeedMore
        } else {
            ReadStatus::Done
        }
    }

    /// Completed value and reset for the next field. Meaningful only after
    /// `feed` reported `Done`.
    pub fn take(&mut self) -> u32 {
        let value = u32::from_be_bytes(self.buf);
        self.reset();
        value
    }

    pub fn reset(&mut self) {
        self.filled = 0;
    }
}

/// Reads one length-prefixed UTF-8 string. The four-byte prefix is bounded
/// to [0, `MAX_STRING_LEN`]; out-of-range prefixes are malformed and no
/// payload byte is ever read for them.
#[derive(Debug, Default)]
pub struct StringReader {
    len: U32Reader,
    have_len: bool,
    expected: usize,
    buf: Vec<u8>,
    text: String,
    done: bool,
    failed: bool,
}

impl StringReader {
    pub fn feed(&mut self, input: &mut &[u8]) -> ReadStatus {
        if self.failed {
            return ReadStatus::Malformed;
        }
        if self.done {
            return ReadStatus::Done;
        }
        if !self.have_len {
            match self.len.feed(input) {
                ReadStatus::NeedMore => return ReadStatus::NeedMore,
                ReadStatus::Malformed => return self.fail(),
                ReadStatus::Done => {
                    let n = self.len.take();
                    if n > MAX_STRING_LEN {
                        return self.fail();
                    }
                    self.have_len = true;
                    self.expected = n as usize;
                    self.buf.reserve(self.expected);
                }
            }
        }
        let take = (self.expected - self.buf.len()).min(input.len());
        self.buf.extend_from_slice(&input[..take]);
        *input = &input[take..];
        if self.buf.len() < self.expected {
            return ReadStatus::NeedMore;
        }
        match std::str::from_utf8(&self.buf) {
            Ok(s) => {
                self.text = s.to_owned();
                self.done = true;
                ReadStatus::Done
            }
            Err(_) => self.fail(),
        }
    }

    /// Completed text. Meaningful only after `feed` reported `Done`.
    pub fn take_text(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn reset(&mut self) {
        self.len.reset();
        self.have_len = false;
        self.expected = 0;
        self.buf.clear();
        self.text.clear();
        self.done = false;
        self.failed = false;
    }

    fn fail(&mut self) -> ReadStatus {
        self.failed = true;
        ReadStatus::Malformed
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum WorkField {
    #[default]
    SrcPort,
    DstPort,
    JobId,
    Start,
    End,
    Locator,
    Checker,
    Filename,
}

/// Reads one work frame body: five fixed integers, then three strings.
/// Advances to the next field only once the current one completes.
#[derive(Debug, Default)]
pub struct WorkFrameReader {
    field: WorkField,
    ints: U32Reader,
    strings: StringReader,
    src_port: u16,
    dst_port: u16,
    job_id: u32,
    start: u32,
    end: u32,
    locator: String,
    checker: String,
    filename: String,
    done: bool,
    failed: bool,
}

impl WorkFrameReader {
    pub fn feed(&mut self, input: &mut &[u8]) -> ReadStatus {
        if self.failed {
            return ReadStatus::Malformed;
        }
        if self.done {
            return ReadStatus::Done;
        }
        loop {
            let status = match self.field {
                WorkField::SrcPort
                | WorkField::DstPort
                | WorkField::JobId
                | WorkField::Start
                | WorkField::End => self.ints.feed(input),
                WorkField::Locator | WorkField::Checker | WorkField::Filename => {
                    self.strings.feed(input)
                }
            };
            match status {
                ReadStatus::NeedMore => return ReadStatus::NeedMore,
                ReadStatus::Malformed => return self.fail(),
                ReadStatus::Done => {}
            }
            match self.field {
                WorkField::SrcPort => match u16::try_from(self.ints.take()) {
                    Ok(p) => {
                        self.src_port = p;
                        self.field = WorkField::DstPort;
                    }
                    Err(_) => return self.fail(),
                },
                WorkField::DstPort => match u16::try_from(self.ints.take()) {
                    Ok(p) => {
                        self.dst_port = p;
                        self.field = WorkField::JobId;
                    }
                    Err(_) => return self.fail(),
                },
                WorkField::JobId => {
                    self.job_id = self.ints.take();
                    self.field = WorkField::Start;
                }
                WorkField::Start => {
                    self.start = self.ints.take();
                    self.field = WorkField::End;
                }
                WorkField::End => {
                    self.end = self.ints.take();
                    self.field = WorkField::Locator;
                }
                WorkField::Locator => {
                    self.locator = self.strings.take_text();
                    self.strings.reset();
                    self.field = WorkField::Checker;
                }
                WorkField::Checker => {
                    self.checker = self.strings.take_text();
                    self.strings.reset();
                    self.field = WorkField::Filename;
                }
                WorkField::Filename => {
                    self.filename = self.strings.take_text();
                    self.strings.reset();
                    self.done = true;
                    return ReadStatus::Done;
                }
            }
        }
    }

    /// Completed frame and reset for the next one. Meaningful only after
    /// `feed` reported `Done`.
    pub fn take_frame(&mut self) -> WorkFrame {
        let frame = WorkFrame {
            src_port: self.src_port,
            dst_port: self.dst_port,
            job_id: self.job_id,
            start: self.start,
            end: self.end,
            locator: std::mem::take(&mut self.locator),
            checker: std::mem::take(&mut self.checker),
            filename: std::mem::take(&mut self.filename),
        };
        self.reset();
        frame
    }

    pub fn reset(&mut self) {
        self.field = WorkField::SrcPort;
        self.ints.reset();
        self.strings.reset();
        self.locator.clear();
        self.checker.clear();
        self.filename.clear();
        self.done = false;
        self.failed = false;
    }

    fn fail(&mut self) -> ReadStatus {
        self.failed = true;
        ReadStatus::Malformed
    }
}

/// Reads one address frame body: a single port.
#[derive(Debug, Default)]
pub struct AddressFrameReader {
    ints: U32Reader,
    port: u16,
    done: bool,
    failed: bool,
}

impl AddressFrameReader {
    pub fn feed(&mut self, input: &mut &[u8]) -> ReadStatus {
        if self.failed {
            return ReadStatus::Malformed;
        }
        if self.done {
            return ReadStatus::Done;
        }
        match self.ints.feed(input) {
            ReadStatus::NeedMore => ReadStatus::NeedMore,
            ReadStatus::Malformed => {
                self.failed = true;
                ReadStatus::Malformed
            }
            ReadStatus::Done => match u16::try_from(self.ints.take()) {
                Ok(p) => {
                    self.port = p;
                    self.done = true;
                    ReadStatus::Done
                }
                Err(_) => {
                    self.failed = true;
                    ReadStatus::Malformed
                }
            },
        }
    }

    /// Completed frame and reset for the next one. Meaningful only after
    /// `feed` reported `Done`.
    pub fn take_frame(&mut self) -> AddressFrame {
        let frame = AddressFrame { port: self.port };
        self.reset();
        frame
    }

    pub fn reset(&mut self) {
        self.ints.reset();
        self.done = false;
        self.failed = false;
    }
}

/// Reads whole frames off a connection: the four-byte kind discriminator,
/// then the matching body. `take` yields the frame and re-arms the reader
/// so consecutive frames on one stream decode back to back.
#[derive(Debug, Default)]
pub struct FrameReader {
    kind: U32Reader,
    have_kind: bool,
    kind_value: u32,
    work: WorkFrameReader,
    address: AddressFrameReader,
    ready: Option<Frame>,
    failed: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, input: &mut &[u8]) -> ReadStatus {
        if self.failed {
            return ReadStatus::Malformed;
        }
        if self.ready.is_some() {
            return ReadStatus::Done;
        }
        if !self.have_kind {
            match self.kind.feed(input) {
                ReadStatus::NeedMore => return ReadStatus::NeedMore,
                ReadStatus::Malformed => return self.fail(),
                ReadStatus::Done => {
                    self.kind_value = self.kind.take();
                    if self.kind_value != KIND_WORK && self.kind_value != KIND_ADDRESS {
                        return self.fail();
                    }
                    self.have_kind = true;
                }
            }
        }
        let status = if self.kind_value == KIND_WORK {
            match self.work.feed(input) {
                ReadStatus::Done => {
                    self.ready = Some(Frame::Work(self.work.take_frame()));
                    ReadStatus::Done
                }
                status => status,
            }
        } else {
            match self.address.feed(input) {
                ReadStatus::Done => {
                    self.ready = Some(Frame::Address(self.address.take_frame()));
                    ReadStatus::Done
                }
                status => status,
            }
        };
        if status == ReadStatus::Malformed {
            self.failed = true;
        }
        status
    }

    /// Take the completed frame and re-arm for the next one. `None` unless
    /// the last `feed` reported `Done`.
    pub fn take(&mut self) -> Option<Frame> {
        let frame = self.ready.take();
        if frame.is_some() {
            self.have_kind = false;
        }
        frame
    }

    pub fn reset(&mut self) {
        self.kind.reset();
        self.have_kind = false;
        self.kind_value = 0;
        self.work.reset();
        self.address.reset();
        self.ready = None;
        self.failed = false;
    }

    fn fail(&mut self) -> ReadStatus {
        self.failed = true;
        ReadStatus::Malformed
    }
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("string field exceeds {MAX_STRING_LEN} bytes")]
    StringTooLong,
}

/// Encode a work frame, kind discriminator included.
pub fn encode_work(frame: &WorkFrame) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(
        9 * 4 + frame.locator.len() + frame.checker.len() + frame.filename.len(),
    );
    put_u32(&mut out, KIND_WORK);
    put_u32(&mut out, u32::from(frame.src_port));
    put_u32(&mut out, u32::from(frame.dst_port));
    put_u32(&mut out, frame.job_id);
    put_u32(&mut out, frame.start);
    put_u32(&mut out, frame.end);
    put_str(&mut out, &frame.locator)?;
    put_str(&mut out, &frame.checker)?;
    put_str(&mut out, &frame.filename)?;
    Ok(out)
}

/// Encode an address frame, kind discriminator included.
pub fn encode_address(frame: &AddressFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    put_u32(&mut out, KIND_ADDRESS);
    put_u32(&mut out, u32::from(frame.port));
    out
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    if s.len() > MAX_STRING_LEN as usize {
        return Err(EncodeError::StringTooLong);
    }
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_work() -> WorkFrame {
        WorkFrame {
            src_port: 7777,
            dst_port: 7777,
            job_id: 3,
            start: 0,
            end: 99,
            locator: "checkers/collatz.so".into(),
            checker: "collatz::Steps".into(),
            filename: "collatz.txt".into(),
        }
    }

    fn decode_all(bytes: &[u8]) -> (Vec<Frame>, ReadStatus) {
        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        let mut rest = bytes;
        loop {
            match reader.feed(&mut rest) {
                ReadStatus::Done => match reader.take() {
                    Some(frame) => frames.push(frame),
                    None => panic!("Done without a frame"),
                },
                status => return (frames, status),
            }
        }
    }

    #[test]
    fn work_roundtrip() {
        let frame = sample_work();
        let bytes = encode_work(&frame).unwrap();
        let (frames, status) = decode_all(&bytes);
        assert_eq!(status, ReadStatus::NeedMore);
        assert_eq!(frames, vec![Frame::Work(frame)]);
    }

    #[test]
    fn address_roundtrip() {
        let frame = AddressFrame { port: 7778 };
        let bytes = encode_address(&frame);
        let (frames, _) = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::Address(frame)]);
    }

    #[test]
    fn one_byte_at_a_time() {
        let frame = sample_work();
        let bytes = encode_work(&frame).unwrap();
        let mut reader = FrameReader::new();
        let mut decoded = None;
        for (i, b) in bytes.iter().enumerate() {
            let mut input = std::slice::from_ref(b);
            match reader.feed(&mut input) {
                ReadStatus::Done => {
                    assert_eq!(i, bytes.len() - 1, "early Done at byte {i}");
                    decoded = reader.take();
                }
                ReadStatus::NeedMore => assert!(i < bytes.len() - 1, "NeedMore at last byte"),
                ReadStatus::Malformed => panic!("malformed at byte {i}"),
            }
            assert!(input.is_empty(), "byte {i} not consumed");
        }
        assert_eq!(decoded, Some(Frame::Work(frame)));
    }

    #[test]
    fn pipelined_frames_decode_back_to_back() {
        let work = sample_work();
        let address = AddressFrame { port: 4242 };
        let mut bytes = encode_work(&work).unwrap();
        bytes.extend_from_slice(&encode_address(&address));
        let (frames, status) = decode_all(&bytes);
        assert_eq!(status, ReadStatus::NeedMore);
        assert_eq!(frames, vec![Frame::Work(work), Frame::Address(address)]);
    }

    #[test]
    fn empty_string_field_roundtrip() {
        let mut frame = sample_work();
        frame.filename = String::new();
        let bytes = encode_work(&frame).unwrap();
        let (frames, _) = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::Work(frame)]);
    }

    #[test]
    fn max_length_string_roundtrip() {
        let mut frame = sample_work();
        frame.locator = "x".repeat(MAX_STRING_LEN as usize);
        let bytes = encode_work(&frame).unwrap();
        let (frames, _) = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::Work(frame)]);
    }

    /// A work frame prefix up to and including the range fields, ready for a
    /// hand-built locator length prefix.
    fn work_prefix() -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [KIND_WORK, 7777, 7777, 1, 0, 9] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn oversized_length_rejected_without_reading_payload() {
        let mut bytes = work_prefix();
        bytes.extend_from_slice(&(MAX_STRING_LEN + 1).to_be_bytes());
        let payload = [0xABu8; 16];
        bytes.extend_from_slice(&payload);

        let mut reader = FrameReader::new();
        let mut rest = &bytes[..];
        assert_eq!(reader.feed(&mut rest), ReadStatus::Malformed);
        // Everything after the offending length prefix is untouched.
        assert_eq!(rest, &payload);
    }

    #[test]
    fn negative_length_rejected() {
        let mut bytes = work_prefix();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let (frames, status) = decode_all(&bytes);
        assert!(frames.is_empty());
        assert_eq!(status, ReadStatus::Malformed);
    }

    #[test]
    fn reserved_kind_rejected() {
        let bytes = 1u32.to_be_bytes();
        let (frames, status) = decode_all(&bytes);
        assert!(frames.is_empty());
        assert_eq!(status, ReadStatus::Malformed);
    }

    #[test]
    fn unknown_kind_rejected() {
        let bytes = 7u32.to_be_bytes();
        let (_, status) = decode_all(&bytes);
        assert_eq!(status, ReadStatus::Malformed);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut bytes = work_prefix();
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xC3, 0x28]);
        let (_, status) = decode_all(&bytes);
        assert_eq!(status, ReadStatus::Malformed);
    }

    #[test]
    fn port_out_of_range_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&KIND_ADDRESS.to_be_bytes());
        bytes.extend_from_slice(&70_000u32.to_be_bytes());
        let (_, status) = decode_all(&bytes);
        assert_eq!(status, ReadStatus::Malformed);
    }

    #[test]
    fn encode_rejects_oversized_string() {
        let mut frame = sample_work();
        frame.checker = "y".repeat(MAX_STRING_LEN as usize + 1);
        assert!(matches!(encode_work(&frame), Err(EncodeError::StringTooLong)));
    }

    #[test]
    fn malformed_is_sticky_until_reset() {
        let bytes = 9u32.to_be_bytes();
        let mut reader = FrameReader::new();
        let mut rest = &bytes[..];
        assert_eq!(reader.feed(&mut rest), ReadStatus::Malformed);
        let good = encode_address(&AddressFrame { port: 1 });
        let mut rest = &good[..];
        assert_eq!(reader.feed(&mut rest), ReadStatus::Malformed);
        reader.reset();
        assert_eq!(reader.feed(&mut rest), ReadStatus::Done);
    }
}
