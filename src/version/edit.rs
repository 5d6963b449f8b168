//! Version edits: the additive deltas persisted in the manifest. Each edit
//! is a tagged sequence of fields so old readers skip nothing and new
//! fields can be appended.

use crate::byteutils::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};
use crate::error::Error;
use crate::format::SequenceNumber;
use crate::Result;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A table added by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub number: u64,
    pub file_size: u64,
    /// Smallest and largest internal keys in the table.
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNumber>,
    pub compaction_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    pub fn new() -> VersionEdit {
        VersionEdit::default()
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: Vec<u8>,
        largest: Vec<u8>,
    ) {
        self.new_files.push((
            level,
            NewFile {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn set_compaction_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compaction_pointers.push((level, key));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            put_varint32(&mut buf, TAG_COMPARATOR);
            put_length_prefixed_slice(&mut buf, name.as_bytes());
        }
        if let Some(n) = self.log_number {
            put_varint32(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.prev_log_number {
            put_varint32(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, n);
        }
        if let Some(n) = self.last_sequence {
            put_varint32(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, n);
        }
        for (level, key) in &self.compaction_pointers {
            put_varint32(&mut buf, TAG_COMPACT_POINTER);
            put_varint32(&mut buf, *level as u32);
            put_length_prefixed_slice(&mut buf, key);
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut buf, TAG_DELETED_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(&mut buf, TAG_NEW_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, file.number);
            put_varint64(&mut buf, file.file_size);
            put_length_prefixed_slice(&mut buf, &file.smallest);
            put_length_prefixed_slice(&mut buf, &file.largest);
        }
        buf
    }

    pub fn decode(mut src: &[u8]) -> Result<VersionEdit> {
        let mut edit = VersionEdit::default();
        while !src.is_empty() {
            let (tag, n) =
                get_varint32(src).ok_or_else(|| Error::corruption("bad edit tag"))?;
            src = &src[n..];
            match tag {
                TAG_COMPARATOR => {
                    let (name, n) = get_length_prefixed_slice(src)
                        .ok_or_else(|| Error::corruption("bad comparator name"))?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption("comparator name not utf-8"))?,
                    );
                    src = &src[n..];
                }
                TAG_LOG_NUMBER => {
                    let (v, n) = take_varint64(src, "log number")?;
                    edit.log_number = Some(v);
                    src = &src[n..];
                }
                TAG_PREV_LOG_NUMBER => {
                    let (v, n) = take_varint64(src, "prev log number")?;
                    edit.prev_log_number = Some(v);
                    src = &src[n..];
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (v, n) = take_varint64(src, "next file number")?;
                    edit.next_file_number = Some(v);
                    src = &src[n..];
                }
                TAG_LAST_SEQUENCE => {
                    let (v, n) = take_varint64(src, "last sequence")?;
                    edit.last_sequence = Some(v);
                    src = &src[n..];
                }
                TAG_COMPACT_POINTER => {
                    let (level, n) = take_level(src)?;
                    src = &src[n..];
                    let (key, n) = get_length_prefixed_slice(src)
                        .ok_or_else(|| Error::corruption("bad compaction pointer key"))?;
                    edit.compaction_pointers.push((level, key.to_vec()));
                    src = &src[n..];
                }
                TAG_DELETED_FILE => {
                    let (level, n) = take_level(src)?;
                    src = &src[n..];
                    let (number, n) = take_varint64(src, "deleted file number")?;
                    edit.deleted_files.push((level, number));
                    src = &src[n..];
                }
                TAG_NEW_FILE => {
                    let (level, n) = take_level(src)?;
                    src = &src[n..];
                    let (number, n) = take_varint64(src, "new file number")?;
                    src = &src[n..];
                    let (file_size, n2) = take_varint64(src, "new file size")?;
                    src = &src[n2..];
                    let (smallest, n3) = get_length_prefixed_slice(src)
                        .ok_or_else(|| Error::corruption("bad smallest key"))?;
                    src = &src[n3..];
                    let (largest, n4) = get_length_prefixed_slice(src)
                        .ok_or_else(|| Error::corruption("bad largest key"))?;
                    src = &src[n4..];
                    edit.new_files.push((
                        level,
                        NewFile {
                            number,
                            file_size,
                            smallest: smallest.to_vec(),
                            largest: largest.to_vec(),
                        },
                    ));
                }
                _ => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag: {}",
                        tag
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn take_varint64(src: &[u8], what: &str) -> Result<(u64, usize)> {
    get_varint64(src).ok_or_else(|| Error::corruption(format!("bad {}", what)))
}

fn take_level(src: &[u8]) -> Result<(usize, usize)> {
    let (level, n) = get_varint32(src).ok_or_else(|| Error::corruption("bad level"))?;
    let level = level as usize;
    if level >= crate::options::NUM_LEVELS {
        return Err(Error::corruption(format!("level {} out of range", level)));
    }
    Ok((level, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(edit: &VersionEdit) {
        let encoded = edit.encode();
        let decoded = VersionEdit::decode(&encoded).unwrap();
        assert_eq!(&decoded, edit);
    }

    #[test]
    fn test_empty_edit() {
        roundtrip(&VersionEdit::new());
    }

    #[test]
    fn test_full_edit_roundtrip() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("stratadb.BytewiseComparator".to_string());
        edit.log_number = Some(12);
        edit.prev_log_number = Some(9);
        edit.next_file_number = Some(42);
        edit.last_sequence = Some(123_456);
        edit.set_compaction_pointer(1, b"pointer-key".to_vec());
        edit.delete_file(2, 17);
        edit.add_file(3, 18, 4096, b"aaa".to_vec(), b"zzz".to_vec());
        roundtrip(&edit);
    }

    #[test]
    fn test_many_files() {
        let mut edit = VersionEdit::new();
        for i in 0..50u64 {
            edit.add_file(
                (i % 7) as usize,
                i,
                i * 100,
                format!("small{:03}", i).into_bytes(),
                format!("large{:03}", i).into_bytes(),
            );
            edit.delete_file((i % 7) as usize, i + 1000);
        }
        roundtrip(&edit);
    }

    #[test]
    fn test_truncated_rejected() {
        let mut edit = VersionEdit::new();
        edit.add_file(1, 7, 100, b"a".to_vec(), b"b".to_vec());
        let encoded = edit.encode();
        assert!(VersionEdit::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, 99);
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn test_out_of_range_level_rejected() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, TAG_DELETED_FILE);
        put_varint32(&mut buf, 40);
        put_varint64(&mut buf, 1);
        assert!(VersionEdit::decode(&buf).is_err());
    }
}
