use crate::byteutils::put_fixed32;
use crate::env::WritableFile;
use crate::journal::{mask_crc, record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::Result;

pub struct JournalWriter {
    dest: Box<dyn WritableFile>,
    block_offset: usize,
}

impl JournalWriter {
    pub fn new(dest: Box<dyn WritableFile>) -> JournalWriter {
        JournalWriter {
            dest,
            block_offset: 0,
        }
    }

    pub fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut left = record.len();
        let mut offset = 0;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Zero-fill the block trailer and move to a fresh block.
                if leftover > 0 {
                    const ZEROS: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
                    self.dest.append(&ZEROS[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.min(avail);
            let end = fragment_len == left;
            let rtype = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.emit_physical_record(rtype, &record[offset..offset + fragment_len])?;
            offset += fragment_len;
            left -= fragment_len;
            begin = false;
            if left == 0 {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(&mut self, rtype: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        put_fixed32(&mut header, mask_crc(record_crc(rtype, payload)));
        header.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        header.push(rtype as u8);

        self.dest.append(&header)?;
        self.dest.append(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dest.flush()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }
}
