use crate::byteutils::decode_fixed32;
use crate::env::SequentialFile;
use crate::error::Error;
use crate::journal::{record_crc, unmask_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::Result;

pub struct JournalReader {
    src: Box<dyn SequentialFile>,
    block: Vec<u8>,
    pos: usize,
    eof: bool,
}

enum Physical {
    Record(RecordType, Vec<u8>),
    /// Ran out of data; a torn record at the tail lands here too.
    End,
}

impl JournalReader {
    pub fn new(src: Box<dyn SequentialFile>) -> JournalReader {
        JournalReader {
            src,
            block: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Returns the next complete record, or `None` at end of log. A record
    /// torn by a crash at the tail is silently discarded; corruption before
    /// the tail is an error.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembling = false;
        let mut record = Vec::new();
        loop {
            match self.read_physical_record()? {
                Physical::End => return Ok(None),
                Physical::Record(RecordType::Full, data) => {
                    if assembling {
                        return Err(Error::corruption("full record inside fragmented record"));
                    }
                    return Ok(Some(data));
                }
                Physical::Record(RecordType::First, data) => {
                    if assembling {
                        return Err(Error::corruption("two first-fragments without last"));
                    }
                    assembling = true;
                    record = data;
                }
                Physical::Record(RecordType::Middle, data) => {
                    if !assembling {
                        return Err(Error::corruption("middle fragment without first"));
                    }
                    record.extend_from_slice(&data);
                }
                Physical::Record(RecordType::Last, data) => {
                    if !assembling {
                        return Err(Error::corruption("last fragment without first"));
                    }
                    record.extend_from_slice(&data);
                    return Ok(Some(record));
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.block.len() - self.pos < HEADER_SIZE {
                // Block trailer (zero filled) or end of data.
                if !self.refill_block()? {
                    return Ok(Physical::End);
                }
                continue;
            }

            let header = &self.block[self.pos..self.pos + HEADER_SIZE];
            if header.iter().all(|&b| b == 0) {
                // Zeroed region, e.g. a preallocated tail. Nothing further.
                return Ok(Physical::End);
            }
            let masked_crc = decode_fixed32(&header[..4]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if self.pos + HEADER_SIZE + length > self.block.len() {
                if self.eof {
                    // Torn write at the tail; drop it.
                    return Ok(Physical::End);
                }
                return Err(Error::corruption("journal record overruns block"));
            }

            let rtype = RecordType::from_u8(type_byte)?;
            let payload =
                self.block[self.pos + HEADER_SIZE..self.pos + HEADER_SIZE + length].to_vec();
            self.pos += HEADER_SIZE + length;

            if unmask_crc(masked_crc) != record_crc(rtype, &payload) {
                return Err(Error::corruption("journal record checksum mismatch"));
            }
            return Ok(Physical::Record(rtype, payload));
        }
    }

    /// Reads the next 32 KiB block. Returns false when no more data exists.
    fn refill_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.block.clear();
        self.block.resize(BLOCK_SIZE, 0);
        self.pos = 0;
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.src.read(&mut self.block[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.block.truncate(filled);
        Ok(filled > 0)
    }
}
