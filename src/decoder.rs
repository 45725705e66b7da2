//! The LZO1X instruction decoder: opcode dispatch, back-reference execution,
//! and the pull-style streaming read interface built on top of them.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::Error;
use crate::window::HistoryWindow;

/// Largest literal/match length extension this decoder will accept before
/// treating the stream as corrupt, chosen well below `usize`'s range so a
/// hostile stream of zero bytes cannot be used to build an enormous length
/// cheaply.
const MAX_EXTENDED_LENGTH: usize = i32::MAX as usize - 1000;

/// Literal bytes are copied through a small fixed buffer rather than a single
/// allocation sized to an attacker-controlled length.
const LITERAL_CHUNK: usize = 4096;

/// Carried state: the class of literal run produced by the previous
/// instruction, which determines how the next `[0,15]` opcode is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LzoState {
    ZeroCopy,
    SmallCopy(u8),
    LargeCopy,
}

/// Selects which LZO bitstream variant a [`Decoder`] parses.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// The raw LZO1X bitstream, with no container framing.
    Lzo1X,
}

/// A pull-style streaming LZO1X decompressor.
///
/// Wraps a byte source and exposes both an inherent [`Decoder::read`] and an
/// [`std::io::Read`] implementation. Bytes are produced lazily: constructing
/// a `Decoder` consumes only the stream's preamble.
#[derive(Debug)]
pub struct Decoder<R> {
    source: R,
    window: HistoryWindow,
    state: LzoState,
    next_instruction: u8,
    pending: Vec<u8>,
    pending_pos: usize,
    ended: bool,
    total_produced: u64,
}

impl<R: Read> Decoder<R> {
    /// Construct a decoder for the default (and only implemented) format.
    pub fn new(source: R) -> Result<Self, Error> {
        Self::with_format(source, Format::Lzo1X)
    }

    /// Construct a decoder for an explicitly chosen [`Format`].
    pub fn with_format(source: R, format: Format) -> Result<Self, Error> {
        match format {
            Format::Lzo1X => {}
        }

        let mut decoder = Self {
            source,
            window: HistoryWindow::new(),
            state: LzoState::ZeroCopy,
            next_instruction: 0,
            pending: Vec::new(),
            pending_pos: 0,
            ended: false,
            total_produced: 0,
        };
        decoder.consume_preamble()?;
        Ok(decoder)
    }

    fn consume_preamble(&mut self) -> Result<(), Error> {
        let b0 = self.read_u8()?;
        if b0 > 17 {
            let len = b0 as usize - 17;
            self.copy_literal(len)?;
            self.state = LzoState::LargeCopy;
            let next = self.read_u8()?;
            if next < 16 {
                return Err(Error::CorruptStream(
                    "opcode following the literal preamble must be >= 16",
                ));
            }
            self.next_instruction = next;
        } else if b0 == 16 || b0 == 17 {
            return Err(Error::CorruptStream("first opcode must not be 16 or 17"));
        } else {
            self.next_instruction = b0;
        }
        Ok(())
    }

    /// Read decompressed bytes into `dst`, returning the number produced
    /// (`0` at end of stream). May return fewer bytes than `dst.len()` before
    /// end of stream.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        while self.pending_pos >= self.pending.len() && !self.ended {
            self.pending.clear();
            self.pending_pos = 0;
            self.decode_step()?;
        }
        let available = self.pending.len() - self.pending_pos;
        let n = available.min(dst.len());
        dst[..n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
        self.pending_pos += n;
        Ok(n)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        self.source.read_u8().map_err(Self::map_eof)
    }

    fn map_eof(e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Io(e)
        }
    }

    fn extended_length(&mut self) -> Result<usize, Error> {
        let mut total: usize = 0;
        loop {
            let b = self.read_u8()?;
            if b != 0 {
                total = total
                    .checked_add(b as usize)
                    .filter(|&t| t <= MAX_EXTENDED_LENGTH)
                    .ok_or(Error::CorruptStream("extended length overflow"))?;
                return Ok(total);
            }
            total = total
                .checked_add(255)
                .filter(|&t| t <= MAX_EXTENDED_LENGTH)
                .ok_or(Error::CorruptStream("extended length overflow"))?;
        }
    }

    /// Copy `length` literal bytes from the source into the window and the
    /// output side buffer.
    fn copy_literal(&mut self, mut length: usize) -> Result<(), Error> {
        let mut chunk = [0u8; LITERAL_CHUNK];
        while length > 0 {
            let take = length.min(LITERAL_CHUNK);
            self.source
                .read_exact(&mut chunk[..take])
                .map_err(Self::map_eof)?;
            self.window.append(&chunk[..take]);
            self.pending.extend_from_slice(&chunk[..take]);
            self.total_produced += take as u64;
            length -= take;
        }
        Ok(())
    }

    /// Execute a back-reference: copy `length` bytes from `distance` bytes
    /// behind the current output position. `length` may exceed `distance`,
    /// in which case the copy self-replicates byte by byte rather than
    /// bulk-moving an overlapping region.
    fn execute_backref(&mut self, distance: usize, length: usize) -> Result<(), Error> {
        if distance == 0 || distance as u64 > self.total_produced {
            return Err(Error::CorruptStream(
                "back-reference distance exceeds produced output",
            ));
        }
        let mut byte = [0u8; 1];
        let back = distance as isize;
        for _ in 0..length {
            self.window.seek(-back);
            self.window.read_at_cursor(&mut byte);
            self.window.seek(back);
            self.window.append(&byte);
            self.pending.push(byte[0]);
        }
        self.total_produced += length as u64;
        Ok(())
    }

    /// Copy the `trailer` (0..3) literal bytes that follow every
    /// back-reference, and adopt the resulting carried state.
    fn finish_instruction(&mut self, trailer: u8) -> Result<(), Error> {
        self.copy_literal(trailer as usize)?;
        self.state = match trailer {
            0 => LzoState::ZeroCopy,
            n => LzoState::SmallCopy(n),
        };
        Ok(())
    }

    /// Decode exactly one instruction's worth of output into `self.pending`.
    fn decode_step(&mut self) -> Result<(), Error> {
        if self.ended {
            return Ok(());
        }
        let instr = self.next_instruction;

        if instr >= 128 {
            let length = 5 + ((instr >> 5) & 3) as usize;
            let h = self.read_u8()?;
            let distance = ((h as usize) << 3) + ((instr as usize >> 2) & 7) + 1;
            self.execute_backref(distance, length)?;
            self.finish_instruction(instr & 3)?;
        } else if instr >= 64 {
            let length = 3 + ((instr >> 5) & 1) as usize;
            let h = self.read_u8()?;
            let distance = ((h as usize) << 3) + ((instr as usize >> 2) & 7) + 1;
            self.execute_backref(distance, length)?;
            self.finish_instruction(instr & 3)?;
        } else if instr >= 32 {
            let l = instr & 0x1F;
            let length = if l != 0 {
                2 + l as usize
            } else {
                2 + 31 + self.extended_length()?
            };
            let x = self.source.read_u16::<LittleEndian>().map_err(Self::map_eof)?;
            let distance = (x as usize >> 2) + 1;
            self.execute_backref(distance, length)?;
            self.finish_instruction((x & 3) as u8)?;
        } else if instr >= 16 {
            let l = instr & 7;
            let length = if l != 0 {
                2 + l as usize
            } else {
                2 + 7 + self.extended_length()?
            };
            let x = self.source.read_u16::<LittleEndian>().map_err(Self::map_eof)?;
            let high_bit = ((instr & 8) as usize) << 11;
            let distance = 16384 + (high_bit | (x as usize >> 2));
            if distance == 16384 {
                if length != 3 {
                    return Err(Error::CorruptStream(
                        "end-of-stream marker must have length 3",
                    ));
                }
                self.ended = true;
                return Ok(());
            }
            self.execute_backref(distance, length)?;
            self.finish_instruction((x & 3) as u8)?;
        } else {
            match self.state {
                LzoState::ZeroCopy => {
                    let length = if instr != 0 {
                        3 + instr as usize
                    } else {
                        3 + 15 + self.extended_length()?
                    };
                    self.copy_literal(length)?;
                    self.state = LzoState::LargeCopy;
                    self.next_instruction = self.read_u8()?;
                    return Ok(());
                }
                LzoState::SmallCopy(_) => {
                    let h = self.read_u8()?;
                    let distance = ((h as usize) << 2) + ((instr as usize >> 2) & 3) + 1;
                    self.execute_backref(distance, 2)?;
                    self.finish_instruction(instr & 3)?;
                }
                LzoState::LargeCopy => {
                    let h = self.read_u8()?;
                    let distance = ((h as usize) << 2) + ((instr as usize >> 2) & 3) + 2049;
                    self.execute_backref(distance, 3)?;
                    self.finish_instruction(instr & 3)?;
                }
            }
        }

        self.next_instruction = self.read_u8()?;
        Ok(())
    }
}

impl<R: Read> std::io::Read for Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Decoder::read(self, buf).map_err(|e| match e {
            Error::Io(io_err) => io_err,
            Error::UnexpectedEof => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode_all(input: Vec<u8>) -> Vec<u8> {
        let mut decoder = Decoder::new(Cursor::new(input)).expect("construction");
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("decode");
        out
    }

    #[test]
    fn rejects_invalid_first_opcode() {
        let input = vec![0x11, 0x00, 0x00, 0x11];
        let err = Decoder::new(Cursor::new(input)).unwrap_err();
        assert!(matches!(err, Error::CorruptStream(_)));
    }

    #[test]
    fn literal_preamble_then_end_of_stream() {
        let input = vec![0x16, b'H', b'e', b'l', b'l', b'o', 0x11, 0x00, 0x00];
        assert_eq!(decode_all(input), b"Hello");
    }

    #[test]
    fn self_replicating_back_reference() {
        // preamble "A", then distance-1 length-9 back-reference, then EOS.
        let input = vec![18, b'A', 0x27, 0x00, 0x00, 0x11, 0x00, 0x00];
        assert_eq!(decode_all(input), b"AAAAAAAAAA");
    }

    #[test]
    fn trailing_literals_feed_small_copy_state() {
        let input = vec![
            20, b'A', b'B', b'C', // preamble literal "ABC"
            0x42, 0x00, // M2 back-ref distance 1 length 3, trailer S=2
            b'D', b'E', // trailing literals
            0x00, 0x00, // [0,15] SmallCopy back-ref distance 1 length 2, trailer 0
            0x11, 0x00, 0x00, // end of stream
        ];
        assert_eq!(decode_all(input), b"ABCCCCDEEE");
    }

    #[test]
    fn extended_length_back_reference() {
        // preamble "Z", M3 opcode with L=0 (extended), one zero byte then 5,
        // distance 1, trailer 0, then EOS. length = 2 + 31 + 2*255 + 5 = 548.
        let mut input = vec![18, b'Z', 32, 0x00, 0x00, 0x05, 0x00, 0x00];
        input.extend_from_slice(&[0x11, 0x00, 0x00]);
        let out = decode_all(input);
        assert_eq!(out.len(), 549);
        assert!(out.iter().all(|&b| b == b'Z'));
    }

    #[test]
    fn opcode_class_boundary_15_long_literal() {
        let mut input = vec![15];
        let literal: Vec<u8> = (0..18).collect();
        input.extend_from_slice(&literal);
        input.extend_from_slice(&[0x11, 0x00, 0x00]);
        assert_eq!(decode_all(input), literal);
    }

    #[test]
    fn opcode_class_boundary_32_extended_m3() {
        let input = vec![18, b'X', 32, 1, 0, 0, 17, 0, 0];
        let expected = vec![b'X'; 35];
        assert_eq!(decode_all(input), expected);
    }

    #[test]
    fn opcode_class_boundary_63_64_m3_m1() {
        let input = vec![20, b'A', b'B', b'C', 63, 0, 0, 64, 0, 17, 0, 0];
        let mut expected = b"ABC".to_vec();
        expected.extend(std::iter::repeat(b'C').take(36));
        assert_eq!(decode_all(input), expected);
    }

    #[test]
    fn opcode_class_boundary_127_128_m1_m2() {
        let input = vec![
            25, b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', // preamble len 8
            127, 0, b'X', b'Y', b'Z', // M1 distance 8 length 4, trailer 3
            128, 0, // M2 distance 1 length 5, trailer 0
            17, 0, 0,
        ];
        assert_eq!(decode_all(input), b"ABCDEFGHABCDXYZZZZZZ");
    }

    #[test]
    fn maximum_distance_back_reference() {
        let zero_count = 192usize;
        let tail = 173u8;
        let literal_len = 18 + zero_count * 255 + tail as usize;
        assert_eq!(literal_len, 49151);

        let mut input = vec![0u8];
        input.extend(std::iter::repeat(0u8).take(zero_count));
        input.push(tail);
        let pattern: Vec<u8> = (0..literal_len).map(|i| (i % 256) as u8).collect();
        input.extend_from_slice(&pattern);
        input.extend_from_slice(&[0x19, 0xFC, 0xFF]); // distance 49151, length 3
        input.extend_from_slice(&[0x11, 0x00, 0x00]); // EOS

        let out = decode_all(input);
        assert_eq!(out.len(), literal_len + 3);
        assert_eq!(&out[literal_len..], &pattern[0..3]);
    }

    #[test]
    fn draining_an_empty_buffer_is_idempotent() {
        let input = vec![0x13, b'H', b'i', 0x11, 0x00, 0x00];
        let mut decoder = Decoder::new(Cursor::new(input)).unwrap();
        assert_eq!(decoder.read(&mut []).unwrap(), 0);
        assert_eq!(decoder.read(&mut []).unwrap(), 0);
        let mut out = [0u8; 8];
        let n = decoder.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"Hi");
    }

    #[test]
    fn end_of_stream_with_wrong_length_is_corrupt() {
        // distance field encodes 16384 (EOS) but length is 4, not 3.
        let input = vec![18, b'X', 18, 0x00, 0x00];
        let mut decoder = Decoder::new(Cursor::new(input)).unwrap();
        let mut out = [0u8; 16];
        let err = loop {
            match decoder.read(&mut out) {
                Ok(0) => panic!("expected an error before end of stream"),
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::CorruptStream(_)));
    }
}
