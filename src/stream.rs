//! Byte cursor over a contract's operation or register payload.
//!
//! Integers are fixed width little endian. Variable sized fields (byte strings, UTF-8 strings)
//! carry a compact-size length prefix: one byte below `0xfd`, otherwise a marker byte followed by
//! a 2, 4 or 8 byte length. Every read is width exact and fails with [StreamError] when the
//! remaining bytes do not suffice; no read ever panics.

use crate::common::{Address, Genesis, TxHash, U256};
use crate::core::params::{COMPACT_U16, COMPACT_U32, COMPACT_U64};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("truncated stream: need {need} bytes, {left} left")]
    Truncated { need: usize, left: usize },
    #[error("seek to {0} is out of range")]
    OutOfRange(usize),
    #[error("non-canonical compact size")]
    NonCanonical,
    #[error("invalid utf-8 string")]
    InvalidUtf8,
    #[error("invalid enum tag {0:#04x}")]
    InvalidTag(u8),
    #[error("{0} trailing bytes")]
    Trailing(usize),
}

pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

pub trait Decode: Sized {
    fn decode(s: &mut Stream) -> Result<Self, StreamError>;
}

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Stream {
    bytes: Vec<u8>,
    pos: usize,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline(always)]
    pub fn read<T: Decode>(&mut self) -> Result<T, StreamError> {
        T::decode(self)
    }

    #[inline(always)]
    pub fn write<T: Encode + ?Sized>(&mut self, v: &T) -> &mut Self {
        v.encode(&mut self.bytes);
        self
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], StreamError> {
        let left = self.bytes.len() - self.pos;
        if n > left {
            return Err(StreamError::Truncated { need: n, left })
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.bytes[start..self.pos])
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Move the cursor forward by `n` bytes.
    pub fn seek(&mut self, n: usize) -> Result<(), StreamError> {
        let to = self.pos.saturating_add(n);
        if to > self.bytes.len() {
            return Err(StreamError::OutOfRange(to))
        }
        self.pos = to;
        Ok(())
    }

    /// Move the cursor to an absolute position.
    pub fn seek_to(&mut self, pos: usize) -> Result<(), StreamError> {
        if pos > self.bytes.len() {
            return Err(StreamError::OutOfRange(pos))
        }
        self.pos = pos;
        Ok(())
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.pos = 0
    }

    #[inline(always)]
    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn remaining(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// Fail unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), StreamError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(StreamError::Trailing(n)),
        }
    }
}

impl From<Vec<u8>> for Stream {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

macro_rules! impl_le_int {
    ($t: ty, $size: expr) => {
        impl Encode for $t {
            #[inline(always)]
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes())
            }
        }

        impl Decode for $t {
            #[inline(always)]
            fn decode(s: &mut Stream) -> Result<Self, StreamError> {
                let mut buff = [0u8; $size];
                buff.copy_from_slice(s.read_bytes($size)?);
                Ok(<$t>::from_le_bytes(buff))
            }
        }
    };
}

impl_le_int!(u8, 1);
impl_le_int!(u16, 2);
impl_le_int!(u32, 4);
impl_le_int!(u64, 8);

impl Encode for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8)
    }
}

impl Decode for bool {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        match s.read::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            t => Err(StreamError::InvalidTag(t)),
        }
    }
}

impl Encode for U256 {
    fn encode(&self, out: &mut Vec<u8>) {
        let mut buff = [0u8; 32];
        self.to_little_endian(&mut buff);
        out.extend_from_slice(&buff)
    }
}

impl Decode for U256 {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        Ok(U256::from_little_endian(s.read_bytes(32)?))
    }
}

macro_rules! impl_hash_codec {
    ($name: ident, $size: expr) => {
        impl Encode for $name {
            #[inline(always)]
            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(self.as_bytes())
            }
        }

        impl Decode for $name {
            #[inline(always)]
            fn decode(s: &mut Stream) -> Result<Self, StreamError> {
                Ok($name::from_slice(s.read_bytes($size)?))
            }
        }
    };
}

impl_hash_codec!(Address, 32);
impl_hash_codec!(Genesis, 32);
impl_hash_codec!(TxHash, 64);

pub fn write_compact_size(n: u64, out: &mut Vec<u8>) {
    if n < COMPACT_U16 as u64 {
        out.push(n as u8)
    } else if n <= u16::MAX as u64 {
        out.push(COMPACT_U16);
        (n as u16).encode(out)
    } else if n <= u32::MAX as u64 {
        out.push(COMPACT_U32);
        (n as u32).encode(out)
    } else {
        out.push(COMPACT_U64);
        n.encode(out)
    }
}

pub fn read_compact_size(s: &mut Stream) -> Result<u64, StreamError> {
    let (n, min) = match s.read::<u8>()? {
        COMPACT_U16 => (s.read::<u16>()? as u64, COMPACT_U16 as u64),
        COMPACT_U32 => (s.read::<u32>()? as u64, 0x10000),
        COMPACT_U64 => (s.read::<u64>()?, 0x100000000),
        n => return Ok(n as u64),
    };
    if n < min {
        return Err(StreamError::NonCanonical)
    }
    Ok(n)
}

fn read_sized(s: &mut Stream) -> Result<&[u8], StreamError> {
    let n = read_compact_size(s)?;
    let left = s.len() - s.position();
    if n > left as u64 {
        return Err(StreamError::Truncated {
            need: n.min(usize::MAX as u64) as usize,
            left,
        })
    }
    s.read_bytes(n as usize)
}

impl Encode for [u8] {
    fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(self.len() as u64, out);
        out.extend_from_slice(self)
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_slice().encode(out)
    }
}

impl Decode for Vec<u8> {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        Ok(read_sized(s)?.to_vec())
    }
}

impl Encode for str {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_bytes().encode(out)
    }
}

impl Encode for String {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_str().encode(out)
    }
}

impl Decode for String {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        String::from_utf8(read_sized(s)?.to_vec())
            .map_err(|_| StreamError::InvalidUtf8)
    }
}

#[test]
fn test_fixed_width_reads() {
    let mut s = Stream::new();
    s.write(&0x11u8).write(&0x2233u16).write(&0x44556677u32);
    s.write(&u64::MAX);
    assert_eq!(s.len(), 1 + 2 + 4 + 8);
    assert_eq!(s.as_bytes()[1..3], [0x33, 0x22]);
    assert_eq!(s.read::<u8>().unwrap(), 0x11);
    assert_eq!(s.read::<u16>().unwrap(), 0x2233);
    assert_eq!(s.read::<u32>().unwrap(), 0x44556677);
    assert!(!s.at_end());
    assert_eq!(s.read::<u64>().unwrap(), u64::MAX);
    assert!(s.at_end());
    assert_eq!(
        s.read::<u8>(),
        Err(StreamError::Truncated { need: 1, left: 0 })
    );
    s.reset();
    assert_eq!(s.position(), 0);
    assert_eq!(s.read::<u8>().unwrap(), 0x11);
}

#[test]
fn test_truncated_hash() {
    let mut s = Stream::from_bytes(vec![0u8; 40]);
    assert!(s.read::<Address>().is_ok());
    assert_eq!(
        s.read::<TxHash>(),
        Err(StreamError::Truncated { need: 64, left: 8 })
    );
    // failed reads leave the cursor untouched
    assert_eq!(s.position(), 32);
}

#[test]
fn test_seek() {
    let mut s = Stream::from_bytes(vec![1, 2, 3, 4]);
    s.seek(3).unwrap();
    assert_eq!(s.read::<u8>().unwrap(), 4);
    assert_eq!(s.seek(1), Err(StreamError::OutOfRange(5)));
    s.seek_to(1).unwrap();
    assert_eq!(s.remaining(), &[2, 3, 4]);
    assert!(s.seek_to(5).is_err());
}

#[test]
fn test_compact_size() {
    for (n, width) in [
        (0u64, 1usize),
        (0xfc, 1),
        (0xfd, 3),
        (0xffff, 3),
        (0x10000, 5),
        (0xffffffff, 5),
        (0x100000000, 9),
    ] {
        let mut out = Vec::new();
        write_compact_size(n, &mut out);
        assert_eq!(out.len(), width);
        assert_eq!(read_compact_size(&mut Stream::from_bytes(out)), Ok(n));
    }
    // 0x10 encoded with a two byte marker
    let mut s = Stream::from_bytes(vec![COMPACT_U16, 0x10, 0x00]);
    assert_eq!(read_compact_size(&mut s), Err(StreamError::NonCanonical));
}

#[test]
fn test_variable_bytes() {
    let mut s = Stream::new();
    s.write("balance").write(&vec![9u8; 300]);
    assert_eq!(s.read::<String>().unwrap(), "balance");
    assert_eq!(s.read::<Vec<u8>>().unwrap().len(), 300);
    // length prefix promising more than what is left
    let mut s = Stream::from_bytes(vec![0x05, 1, 2]);
    assert_eq!(
        s.read::<Vec<u8>>(),
        Err(StreamError::Truncated { need: 5, left: 2 })
    );
    let mut s = Stream::from_bytes(vec![0x02, 0xff, 0xfe]);
    assert_eq!(s.read::<String>(), Err(StreamError::InvalidUtf8));
}
