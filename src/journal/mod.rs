//! Append-only record log shared by the write-ahead journal and the
//! manifest. Records are framed into 32 KiB blocks; a record larger than
//! the space left in a block is split into first/middle/last fragments so
//! a reader can resynchronize at block boundaries after a crash.
//!
//! Physical record layout: 4-byte masked CRC, 2-byte payload length,
//! 1-byte type, payload. Up to six leftover bytes at the end of a block
//! are zero filled.

use crate::error::Error;
use crate::Result;

pub mod reader;
pub mod writer;

pub use reader::JournalReader;
pub use writer::JournalWriter;

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    fn from_u8(byte: u8) -> Result<RecordType> {
        match byte {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::corruption(format!(
                "unknown journal record type: {}",
                byte
            ))),
        }
    }
}

const MASK_DELTA: u32 = 0xa282ead8;

/// CRCs stored on disk are masked so that computing the CRC of a string
/// that embeds CRCs does not degenerate.
pub(crate) fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub(crate) fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

pub(crate) fn record_crc(rtype: RecordType, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[rtype as u8]);
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{MemStorage, Storage};
    use std::path::Path;

    #[test]
    fn test_crc_mask_roundtrip() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX] {
            let masked = mask_crc(crc);
            assert_ne!(masked, crc);
            assert_eq!(unmask_crc(masked), crc);
        }
    }

    fn write_records(storage: &MemStorage, path: &Path, records: &[Vec<u8>]) {
        let mut writer = JournalWriter::new(storage.create(path).unwrap());
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.flush().unwrap();
    }

    fn read_records(storage: &MemStorage, path: &Path) -> Vec<Vec<u8>> {
        let mut reader = JournalReader::new(storage.open_sequential(path).unwrap());
        let mut records = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_roundtrip_small_records() {
        let storage = MemStorage::new();
        let path = Path::new("/journal");
        let records: Vec<Vec<u8>> = vec![
            b"foo".to_vec(),
            b"bar".to_vec(),
            Vec::new(),
            b"baz".to_vec(),
        ];
        write_records(&storage, path, &records);
        assert_eq!(read_records(&storage, path), records);
    }

    #[test]
    fn test_record_spanning_blocks() {
        let storage = MemStorage::new();
        let path = Path::new("/journal");
        let records: Vec<Vec<u8>> = vec![
            vec![b'a'; BLOCK_SIZE - HEADER_SIZE],
            vec![b'b'; 3 * BLOCK_SIZE],
            b"tail".to_vec(),
        ];
        write_records(&storage, path, &records);
        assert_eq!(read_records(&storage, path), records);
    }

    #[test]
    fn test_trailer_too_small_for_header() {
        let storage = MemStorage::new();
        let path = Path::new("/journal");
        // First record leaves fewer than HEADER_SIZE bytes in the block.
        let records: Vec<Vec<u8>> =
            vec![vec![b'x'; BLOCK_SIZE - 2 * HEADER_SIZE - 3], b"next".to_vec()];
        write_records(&storage, path, &records);
        assert_eq!(read_records(&storage, path), records);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let storage = MemStorage::new();
        let src = Path::new("/journal");
        write_records(&storage, src, &[b"complete".to_vec(), vec![b'y'; 2000]]);

        // Copy all but the final few bytes, simulating a torn write.
        let mut data = Vec::new();
        let mut file = storage.open_sequential(src).unwrap();
        let mut buf = [0u8; 512];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let torn = Path::new("/torn");
        let mut out = storage.create(torn).unwrap();
        out.append(&data[..data.len() - 5]).unwrap();
        drop(out);

        assert_eq!(read_records(&storage, torn), vec![b"complete".to_vec()]);
    }

    #[test]
    fn test_corrupt_payload_is_detected() {
        let storage = MemStorage::new();
        let src = Path::new("/journal");
        write_records(&storage, src, &[b"record-one".to_vec(), b"record-two".to_vec()]);

        let mut data = Vec::new();
        let mut file = storage.open_sequential(src).unwrap();
        let mut buf = [0u8; 512];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        // Flip a payload byte of the first record.
        data[HEADER_SIZE] ^= 0xff;
        let bad = Path::new("/bad");
        let mut out = storage.create(bad).unwrap();
        out.append(&data).unwrap();
        drop(out);

        let mut reader = JournalReader::new(storage.open_sequential(bad).unwrap());
        assert!(reader.read_record().is_err());
    }
}
