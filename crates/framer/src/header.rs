/// The length header which precedes every frame.
///
/// On the wire, this is a u32 in little endian order giving the length of the payload which follows.  There is no
/// type tag at this layer.
use bytes::BufMut;

/// Size of the header.
pub const HEADER_SIZE: usize = 4;

#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Debug)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub(crate) struct Header {
    pub(crate) length: u32,
}

impl Header {
    pub(crate) fn new(length: u32) -> Header {
        Header { length }
    }

    pub(crate) fn encode(&self, dest: &mut impl BufMut) {
        dest.put_u32_le(self.length);
    }

    /// Encode to a fixed array, for callers which need to write the header in pieces.
    pub(crate) fn to_bytes(self) -> [u8; HEADER_SIZE] {
        self.length.to_le_bytes()
    }

    /// Decode a complete header.  Callers accumulate all [HEADER_SIZE] bytes first, so this can't fail.
    pub(crate) fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Header {
        Header {
            length: u32::from_le_bytes(bytes),
        }
    }
}
