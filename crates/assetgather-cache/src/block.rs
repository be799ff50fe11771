//! Checksummed block framing.
//!
//! Cache payloads are split into blocks, each preceded by a 16 byte header:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic, `0x0000b1a3`                     |
//! | 4      | 4    | payload size in bytes                   |
//! | 8      | 8    | first 8 bytes of the payload's BLAKE3   |
//!
//! All integers are little endian. A reader verifies every block before any
//! byte of it is handed to the deserializer.

use std::io::{self, Read, Write};

use tracing::error;

use crate::error::CacheError;

/// Magic value at the start of every block header.
pub const BLOCK_MAGIC: u32 = 0xb1a3;

/// Size of a block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Default payload size of a block.
pub const DEFAULT_BLOCK_SIZE: usize = 4 << 20;

/// 64-bit content checksum of a block payload.
pub fn block_checksum(payload: &[u8]) -> u64 {
    let hash = blake3::hash(payload);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockHeader {
    size: u32,
    checksum: u64,
}

impl BlockHeader {
    fn for_payload(payload: &[u8]) -> Self {
        Self {
            size: payload.len() as u32,
            checksum: block_checksum(payload),
        }
    }

    fn to_bytes(self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    fn parse(bytes: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self, CacheError> {
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != BLOCK_MAGIC {
            error!("Wrong block magic");
            return Err(CacheError::WrongBlockMagic { found: magic });
        }
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&bytes[8..]);
        Ok(Self {
            size,
            checksum: u64::from_le_bytes(checksum),
        })
    }

    fn verify(&self, payload: &[u8]) -> Result<(), CacheError> {
        let actual = block_checksum(payload);
        if actual != self.checksum {
            error!("Wrong block checksum");
            return Err(CacheError::WrongChecksum {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Writer that frames everything written through it into checksummed blocks.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
    block_size: usize,
    bytes_written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    /// Wrap a writer using the default block size.
    pub fn new(inner: W) -> Self {
        Self::with_block_size(inner, DEFAULT_BLOCK_SIZE)
    }

    /// Wrap a writer with a custom block size.
    pub fn with_block_size(inner: W, block_size: usize) -> Self {
        let block_size = block_size.clamp(1, u32::MAX as usize);
        Self {
            inner,
            buffer: Vec::with_capacity(block_size.min(DEFAULT_BLOCK_SIZE)),
            block_size,
            bytes_written: 0,
        }
    }

    /// Bytes written to the underlying writer so far, headers included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_block(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let header = BlockHeader::for_payload(&self.buffer);
        self.inner.write_all(&header.to_bytes())?;
        self.inner.write_all(&self.buffer)?;
        self.bytes_written += (BLOCK_HEADER_SIZE + self.buffer.len()) as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Write the final partial block and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        while !buf.is_empty() {
            let room = self.block_size - self.buffer.len();
            let take = room.min(buf.len());
            self.buffer.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.buffer.len() == self.block_size {
                self.write_block()?;
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Sequential source of verified block payloads.
///
/// Implemented over a memory-mapped slice and over a buffered reader so the
/// entry decoding logic is written once.
pub trait BlockSource {
    /// Load and verify the next block. Returns `false` at the end of input.
    fn advance(&mut self) -> Result<bool, CacheError>;

    /// Unconsumed bytes of the current block.
    fn block(&self) -> &[u8];

    /// Mark bytes of the current block as consumed.
    fn consume(&mut self, amount: usize);

    /// Unconsumed bytes left in the input, including framing.
    fn remaining_len(&self) -> u64;
}

/// Blocks read in place from a byte slice, typically a memory map.
pub struct MappedBlocks<'a> {
    data: &'a [u8],
    block: &'a [u8],
}

impl<'a> MappedBlocks<'a> {
    /// Read blocks from `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, block: &[] }
    }
}

impl BlockSource for MappedBlocks<'_> {
    fn advance(&mut self) -> Result<bool, CacheError> {
        if self.data.is_empty() {
            return Ok(false);
        }
        let Some((header_bytes, rest)) = self.data.split_first_chunk::<BLOCK_HEADER_SIZE>() else {
            error!("Couldn't read block header");
            return Err(CacheError::TruncatedHeader);
        };
        let header = BlockHeader::parse(header_bytes)?;
        let size = header.size as usize;
        if rest.len() < size {
            error!("Incomplete block");
            return Err(CacheError::IncompleteBlock {
                expected: header.size,
                available: rest.len() as u64,
            });
        }
        let (payload, rest) = rest.split_at(size);
        header.verify(payload)?;
        self.block = payload;
        self.data = rest;
        Ok(true)
    }

    fn block(&self) -> &[u8] {
        self.block
    }

    fn consume(&mut self, amount: usize) {
        self.block = &self.block[amount.min(self.block.len())..];
    }

    fn remaining_len(&self) -> u64 {
        (self.block.len() + self.data.len()) as u64
    }
}

/// Blocks copied out of a reader one at a time.
pub struct BufferedBlocks<R: Read> {
    inner: R,
    buffer: Vec<u8>,
    cursor: usize,
    unread: u64,
}

impl<R: Read> BufferedBlocks<R> {
    /// Read blocks from `inner`, which holds `len` bytes.
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            cursor: 0,
            unread: len,
        }
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.unread = self.unread.saturating_sub(filled as u64);
        Ok(filled)
    }
}

impl<R: Read> BlockSource for BufferedBlocks<R> {
    fn advance(&mut self) -> Result<bool, CacheError> {
        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        let read = self
            .read_up_to(&mut header_bytes)
            .map_err(|e| CacheError::io("<cache>", e))?;
        if read == 0 {
            return Ok(false);
        }
        if read < BLOCK_HEADER_SIZE {
            error!("Couldn't read block header");
            return Err(CacheError::TruncatedHeader);
        }
        let header = BlockHeader::parse(&header_bytes)?;
        if u64::from(header.size) > self.unread {
            error!("Incomplete block");
            return Err(CacheError::IncompleteBlock {
                expected: header.size,
                available: self.unread,
            });
        }
        self.buffer.resize(header.size as usize, 0);
        self.cursor = 0;
        let mut payload = std::mem::take(&mut self.buffer);
        let read = self.read_up_to(&mut payload);
        self.buffer = payload;
        let read = read.map_err(|e| CacheError::io("<cache>", e))?;
        if read < header.size as usize {
            error!("Incomplete block");
            return Err(CacheError::IncompleteBlock {
                expected: header.size,
                available: read as u64,
            });
        }
        header.verify(&self.buffer)?;
        Ok(true)
    }

    fn block(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    fn consume(&mut self, amount: usize) {
        self.cursor = (self.cursor + amount).min(self.buffer.len());
    }

    fn remaining_len(&self) -> u64 {
        (self.buffer.len() - self.cursor) as u64 + self.unread
    }
}

/// `Read` adapter over a [`BlockSource`].
///
/// Integrity failures surface as `io::ErrorKind::InvalidData` and set a
/// sticky flag checked by [`ChecksumReader::has_failed`].
pub struct ChecksumReader<S: BlockSource> {
    source: S,
    failed: bool,
}

impl<S: BlockSource> ChecksumReader<S> {
    /// Create a reader over a block source.
    pub fn new(source: S) -> Self {
        Self {
            source,
            failed: false,
        }
    }

    /// Whether a block failed validation.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Unconsumed bytes left in the input, including framing.
    pub fn remaining_len(&self) -> u64 {
        self.source.remaining_len()
    }
}

impl<S: BlockSource> Read for ChecksumReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "cache block failed validation",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.source.block().is_empty() {
            match self.source.advance() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(err) => {
                    self.failed = true;
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
            }
        }
        let block = self.source.block();
        let amount = block.len().min(buf.len());
        buf[..amount].copy_from_slice(&block[..amount]);
        self.source.consume(amount);
        Ok(amount)
    }
}
