// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block framing over a raw byte stream.
//!
//! Two encodings, negotiated by capability: classic (4-byte big-endian
//! length prefix) and chunked (2-byte fragment headers carrying a 15-bit
//! length and a last-fragment flag). Both deliver opaque blocks with
//! boundaries preserved; chunked lets a reader find block boundaries without
//! decoding payloads.

use std::convert::TryInto;
use std::io::Read;
use std::io::Write;
use std::mem;

use rkyv::util::AlignedVec;
use static_assertions::const_assert;

use crate::error::Error;
use crate::prelude::*;

const_assert!(mem::size_of::<usize>() >= mem::size_of::<u32>());

/// Largest legal block: 2^31 - 1 bytes.
pub const MAX_BLOCK: usize = i32::MAX as usize;

/// Hard limit of one chunked fragment payload (15 bits).
pub const MAX_FRAGMENT: usize = 0x7fff;

/// Fragment size writers actually emit; keeps flushes near 8 KiB.
pub const FRAGMENT_TARGET: usize = 8 * 1024;

const LAST_FLAG: u8 = 0x80;

pub trait Framed: Sized {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()>;
    fn framed_read<R: Read>(stream: &mut R) -> Result<Self>;
}

impl Framed for u8 {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.to_be_bytes()).location()
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        let mut buf = [0u8; mem::size_of::<Self>()];
        stream.read_exact(&mut buf).location()?;
        Ok(Self::from_be_bytes(buf))
    }
}

impl Framed for u32 {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.to_be_bytes()).location()
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        let mut buf = [0u8; mem::size_of::<Self>()];
        stream.read_exact(&mut buf).location()?;
        Ok(Self::from_be_bytes(buf))
    }
}

impl Framed for u64 {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.to_be_bytes()).location()
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        let mut buf = [0u8; mem::size_of::<Self>()];
        stream.read_exact(&mut buf).location()?;
        Ok(Self::from_be_bytes(buf))
    }
}

impl Framed for usize {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        let val: u32 = (*self).try_into().location_ctx("block too large")?;
        val.framed_write(stream)
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        // Asserted at top of file that usize >= u32.
        u32::framed_read(stream).map(|u| u.try_into().unwrap())
    }
}

impl Framed for Vec<u8> {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        self.len().framed_write(stream).location()?;
        stream.write_all(self).location()?;
        Ok(())
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        let len = u32::framed_read(stream).location()?;
        let mut buf = vec![0; len as usize];
        stream.read_exact(&mut buf).location()?;
        Ok(buf)
    }
}

impl Framed for String {
    fn framed_write<W: Write>(&self, stream: &mut W) -> Result<()> {
        let bytes = self.as_bytes();
        bytes.len().framed_write(stream).location()?;
        stream.write_all(bytes).location()?;
        Ok(())
    }

    fn framed_read<R: Read>(stream: &mut R) -> Result<Self> {
        let bytes = Vec::<u8>::framed_read(stream).location()?;
        Self::from_utf8(bytes).location()
    }
}

/// Writes whole blocks. One `write_block` delivers exactly one block to the
/// peer's `read_block`.
pub trait BlockWrite: Send {
    fn write_block(&mut self, block: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Reads whole blocks. `Ok(None)` means the peer closed the stream cleanly
/// at a block boundary; EOF anywhere else is [`Error::StreamCorruption`].
pub trait BlockRead: Send {
    fn read_block(&mut self) -> Result<Option<AlignedVec>>;
}

// Returns false on EOF before the first byte, errors on EOF mid-buffer.
fn read_exact_or_boundary_eof<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).location()?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::StreamCorruption(format!(
                "eof after {filled} of {} header bytes",
                buf.len()
            ))
            .into());
        }
        filled += n;
    }
    Ok(true)
}

fn read_payload<R: Read>(stream: &mut R, buf: &mut AlignedVec, len: usize) -> Result<()> {
    let start = buf.len();
    buf.resize(start + len, 0);
    stream.read_exact(&mut buf[start..]).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            anyhow::Error::from(Error::StreamCorruption(format!(
                "eof inside a {len}-byte fragment"
            )))
        } else {
            e.into()
        }
    })
}

pub struct ClassicFrameWriter<W: Write> {
    stream: W,
}

impl<W: Write> ClassicFrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { stream }
    }
}

impl<W: Write + Send> BlockWrite for ClassicFrameWriter<W> {
    fn write_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() > MAX_BLOCK {
            bail!("block of {} bytes exceeds the framing limit", block.len());
        }
        block.len().framed_write(&mut self.stream).location()?;
        self.stream.write_all(block).location()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().location()
    }
}

pub struct ClassicFrameReader<R: Read> {
    stream: R,
}

impl<R: Read> ClassicFrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }
}

impl<R: Read + Send> BlockRead for ClassicFrameReader<R> {
    fn read_block(&mut self) -> Result<Option<AlignedVec>> {
        let mut header = [0u8; 4];
        if !read_exact_or_boundary_eof(&mut self.stream, &mut header).location()? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_BLOCK {
            return Err(Error::StreamCorruption(format!("block length {len} out of range")).into());
        }
        let mut buf = AlignedVec::new();
        read_payload(&mut self.stream, &mut buf, len).location()?;
        Ok(Some(buf))
    }
}

pub struct ChunkedFrameWriter<W: Write> {
    stream: W,
}

impl<W: Write> ChunkedFrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    fn write_fragment(&mut self, payload: &[u8], last: bool) -> Result<()> {
        debug_assert!(payload.len() <= MAX_FRAGMENT);
        let len = payload.len() as u16;
        let mut header = len.to_be_bytes();
        if last {
            header[0] |= LAST_FLAG;
        }
        self.stream.write_all(&header).location()?;
        self.stream.write_all(payload).location()?;
        Ok(())
    }
}

impl<W: Write + Send> BlockWrite for ChunkedFrameWriter<W> {
    fn write_block(&mut self, block: &[u8]) -> Result<()> {
        if block.len() > MAX_BLOCK {
            bail!("block of {} bytes exceeds the framing limit", block.len());
        }
        if block.is_empty() {
            return self.write_fragment(&[], true);
        }
        let mut rest = block;
        while !rest.is_empty() {
            let take = rest.len().min(FRAGMENT_TARGET);
            let (fragment, tail) = rest.split_at(take);
            self.write_fragment(fragment, tail.is_empty()).location()?;
            rest = tail;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush().location()
    }
}

pub struct ChunkedFrameReader<R: Read> {
    stream: R,
}

impl<R: Read> ChunkedFrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream }
    }
}

impl<R: Read + Send> BlockRead for ChunkedFrameReader<R> {
    fn read_block(&mut self) -> Result<Option<AlignedVec>> {
        let mut buf = AlignedVec::new();
        let mut first = true;
        loop {
            let mut header = [0u8; 2];
            let got = read_exact_or_boundary_eof(&mut self.stream, &mut header).location()?;
            if !got {
                if first {
                    return Ok(None);
                }
                return Err(
                    Error::StreamCorruption("eof between fragments of a block".to_string()).into(),
                );
            }
            let last = header[0] & LAST_FLAG != 0;
            header[0] &= !LAST_FLAG;
            let len = u16::from_be_bytes(header) as usize;
            if buf.len() + len > MAX_BLOCK {
                return Err(Error::StreamCorruption(
                    "chunked block exceeds the framing limit".to_string(),
                )
                .into());
            }
            read_payload(&mut self.stream, &mut buf, len).location()?;
            if last {
                return Ok(Some(buf));
            }
            first = false;
        }
    }
}

/// Framing selected at handshake time.
pub enum FrameWriter<W: Write + Send> {
    Classic(ClassicFrameWriter<W>),
    Chunked(ChunkedFrameWriter<W>),
}

impl<W: Write + Send> FrameWriter<W> {
    pub fn new(stream: W, chunked: bool) -> Self {
        if chunked {
            Self::Chunked(ChunkedFrameWriter::new(stream))
        } else {
            Self::Classic(ClassicFrameWriter::new(stream))
        }
    }
}

impl<W: Write + Send> BlockWrite for FrameWriter<W> {
    fn write_block(&mut self, block: &[u8]) -> Result<()> {
        match self {
            Self::Classic(w) => w.write_block(block),
            Self::Chunked(w) => w.write_block(block),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Self::Classic(w) => w.flush(),
            Self::Chunked(w) => w.flush(),
        }
    }
}

pub enum FrameReader<R: Read + Send> {
    Classic(ClassicFrameReader<R>),
    Chunked(ChunkedFrameReader<R>),
}

impl<R: Read + Send> FrameReader<R> {
    pub fn new(stream: R, chunked: bool) -> Self {
        if chunked {
            Self::Chunked(ChunkedFrameReader::new(stream))
        } else {
            Self::Classic(ClassicFrameReader::new(stream))
        }
    }
}

impl<R: Read + Send> BlockRead for FrameReader<R> {
    fn read_block(&mut self) -> Result<Option<AlignedVec>> {
        match self {
            Self::Classic(r) => r.read_block(),
            Self::Chunked(r) => r.read_block(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;
    use crate::error::Error;

    fn round_trip(chunked: bool, blocks: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut sink = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut sink, chunked);
            for block in blocks {
                writer.write_block(block).unwrap();
            }
            writer.flush().unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(sink), chunked);
        let mut out = Vec::new();
        while let Some(block) = reader.read_block().unwrap() {
            out.push(block.to_vec());
        }
        out
    }

    #[test]
    fn classic_round_trips_blocks() {
        let blocks = vec![vec![], vec![1], vec![0xab; 100_000]];
        assert_eq!(round_trip(false, &blocks), blocks);
    }

    #[test]
    fn chunked_round_trips_blocks() {
        let blocks = vec![
            vec![],
            vec![7; FRAGMENT_TARGET],
            vec![9; FRAGMENT_TARGET + 1],
            vec![1; MAX_FRAGMENT + 1],
        ];
        assert_eq!(round_trip(true, &blocks), blocks);
    }

    #[test]
    fn chunked_fragments_carry_last_flag_only_once() {
        let mut sink = Vec::new();
        {
            let mut writer = ChunkedFrameWriter::new(&mut sink);
            writer.write_block(&vec![0u8; FRAGMENT_TARGET * 2]).unwrap();
        }
        // Two fragments: headers at offsets 0 and 2 + FRAGMENT_TARGET.
        assert_eq!(sink[0] & 0x80, 0);
        assert_eq!(sink[2 + FRAGMENT_TARGET] & 0x80, 0x80);
    }

    #[test]
    fn classic_eof_mid_block_is_corruption() {
        let mut sink = Vec::new();
        {
            let mut writer = ClassicFrameWriter::new(&mut sink);
            writer.write_block(&[1, 2, 3, 4]).unwrap();
        }
        sink.truncate(6);
        let mut reader = ClassicFrameReader::new(Cursor::new(sink));
        let err = reader.read_block().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StreamCorruption(_))
        ));
    }

    #[test]
    fn chunked_eof_between_fragments_is_corruption() {
        let mut sink = Vec::new();
        {
            let mut writer = ChunkedFrameWriter::new(&mut sink);
            writer.write_block(&vec![0u8; FRAGMENT_TARGET + 1]).unwrap();
        }
        sink.truncate(2 + FRAGMENT_TARGET);
        let mut reader = ChunkedFrameReader::new(Cursor::new(sink));
        let err = reader.read_block().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::StreamCorruption(_))
        ));
    }

    #[test]
    fn eof_at_boundary_is_clean() {
        let mut reader = ClassicFrameReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_block().unwrap().is_none());
        let mut reader = ChunkedFrameReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_block().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_round_trip_any_block(
            block in proptest::collection::vec(any::<u8>(), 0..70_000),
            chunked in any::<bool>(),
        ) {
            let out = round_trip(chunked, std::slice::from_ref(&block));
            prop_assert_eq!(out, vec![block]);
        }

        #[test]
        fn prop_block_sequence_preserves_order_and_boundaries(
            blocks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..2_000), 0..8),
            chunked in any::<bool>(),
        ) {
            let out = round_trip(chunked, &blocks);
            prop_assert_eq!(out, blocks);
        }
    }
}
