//! Binary dump persistence: record framing and the dump location context.
//!
//! Every record is a `u32` little-endian payload length followed by the
//! bincode-encoded payload. The explicit prefix lets a reader tell a clean
//! end-of-stream (no more records) apart from a truncated file, which is
//! fatal for the whole load: a cut-off variable-length blob cannot be
//! safely reinterpreted as a shorter field.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QueueError, Result};

/// Where dump files live and which queue they belong to.
///
/// Passed explicitly to every dump/load call; there is no ambient dump
/// configuration. File names are derived deterministically from the
/// upper-cased queue name.
#[derive(Debug, Clone)]
pub struct DumpContext {
    dir: PathBuf,
    queue_name: String,
}

impl DumpContext {
    pub fn new(dir: impl Into<PathBuf>, queue_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            queue_name: queue_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.dir
            .join(format!("jobs.{}.dump", self.queue_name.to_uppercase()))
    }

    pub fn groups_file(&self) -> PathBuf {
        self.dir
            .join(format!("groups.{}.dump", self.queue_name.to_uppercase()))
    }
}

pub(crate) fn write_record<T: Serialize>(writer: &mut impl Write, value: &T) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| QueueError::DumpFormat(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| QueueError::DumpFormat("record exceeds the 4 GiB frame limit".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

/// Read one framed record. `Ok(None)` means the stream ended cleanly at a
/// record boundary; a short read anywhere else is a `DumpFormat` error.
pub(crate) fn read_record<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(QueueError::DumpFormat(format!(
                "truncated record: {} payload bytes expected",
                len
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let (value, consumed) =
        bincode::serde::decode_from_slice(&payload, bincode::config::standard())
            .map_err(|e| QueueError::DumpFormat(e.to_string()))?;
    if consumed != len {
        return Err(QueueError::DumpFormat(format!(
            "record decoded to {} of {} payload bytes",
            consumed, len
        )));
    }
    Ok(Some(value))
}

/// Fill `buf` completely, or report a clean EOF if the stream ended before
/// the first byte. EOF part-way through the buffer is a format error.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(QueueError::DumpFormat(
                    "truncated record length prefix".to_string(),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
    }

    #[test]
    fn test_record_round_trip() {
        let mut buf = Vec::new();
        let a = Sample {
            id: 1,
            name: "first".to_string(),
        };
        let b = Sample {
            id: 2,
            name: "second".to_string(),
        };
        write_record(&mut buf, &a).unwrap();
        write_record(&mut buf, &b).unwrap();

        let mut cursor = &buf[..];
        assert_eq!(read_record::<Sample>(&mut cursor).unwrap(), Some(a));
        assert_eq!(read_record::<Sample>(&mut cursor).unwrap(), Some(b));
        assert_eq!(read_record::<Sample>(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut buf = Vec::new();
        write_record(
            &mut buf,
            &Sample {
                id: 3,
                name: "x".repeat(100),
            },
        )
        .unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = &buf[..];
        match read_record::<Sample>(&mut cursor) {
            Err(QueueError::DumpFormat(_)) => {}
            other => panic!("expected DumpFormat error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_prefix_is_an_error() {
        let buf = [5u8, 0];
        let mut cursor = &buf[..];
        match read_record::<Sample>(&mut cursor) {
            Err(QueueError::DumpFormat(_)) => {}
            other => panic!("expected DumpFormat error, got {:?}", other),
        }
    }

    #[test]
    fn test_dump_context_file_names() {
        let ctx = DumpContext::new("/var/dump", "main_queue");
        assert!(ctx.jobs_file().ends_with("jobs.MAIN_QUEUE.dump"));
        assert!(ctx.groups_file().ends_with("groups.MAIN_QUEUE.dump"));
    }
}
