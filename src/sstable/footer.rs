use crate::byteutils::{decode_fixed64, get_varint64, put_fixed64, put_varint64};
use crate::error::Error;
use crate::Result;

pub const FOOTER_MAGIC: u64 = 0xdb4775248b80fb57;

/// Two varint64-encoded handles padded to 40 bytes, then the magic.
pub const FOOTER_SIZE: usize = 40 + 8;

const MAX_HANDLE_ENCODED_LEN: usize = 10 + 10;

/// Location of a block within the table file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> BlockHandle {
        BlockHandle { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_HANDLE_ENCODED_LEN);
        self.encode_to(&mut out);
        out
    }

    /// Decodes a handle from the front of `src`, returning the bytes
    /// consumed.
    pub fn decode_from(src: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n1) =
            get_varint64(src).ok_or_else(|| Error::corruption("bad block handle offset"))?;
        let (size, n2) = get_varint64(&src[n1..])
            .ok_or_else(|| Error::corruption("bad block handle size"))?;
        Ok((BlockHandle { offset, size }, n1 + n2))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut out);
        self.index_handle.encode_to(&mut out);
        out.resize(FOOTER_SIZE - 8, 0);
        put_fixed64(&mut out, FOOTER_MAGIC);
        debug_assert_eq!(out.len(), FOOTER_SIZE);
        out
    }

    pub fn decode(src: &[u8]) -> Result<Footer> {
        if src.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }
        let magic = decode_fixed64(&src[FOOTER_SIZE - 8..]);
        if magic != FOOTER_MAGIC {
            return Err(Error::corruption("not a table file (bad magic)"));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}
