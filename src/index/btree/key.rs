use std::fmt::Debug;
use byteorder::{ByteOrder, LittleEndian};

/// A fixed-width key type storable in B+Tree pages.
///
/// Ordering comes from the decoded value (`Ord`), not from the byte
/// encoding, so the encoding only has to round-trip.
pub trait IndexKey: Copy + Ord + Debug + Send + Sync + 'static {
    /// Encoded width in bytes. Every key of the type occupies exactly this
    /// many bytes in a node entry.
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i32(buf)
    }
}

impl IndexKey for u32 {
    const ENCODED_LEN: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

impl IndexKey for i64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

impl IndexKey for u64 {
    const ENCODED_LEN: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }

    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}
