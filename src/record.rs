//! Record framing: `u32 LE length | u8 tag | payload`.
//!
//! `length` counts the tag byte plus the payload. Six tags are defined; only
//! `Put`, `ReadHead` and `ReadDone` are interpreted here — tags 4-6 are
//! reserved for transactional-read records used by layers above this crate,
//! and are decoded only as opaque payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RecordError;

pub const TAG_PUT: u8 = 1;
pub const TAG_READ_HEAD: u8 = 2;
pub const TAG_READ_DONE: u8 = 3;
pub const TAG_RESERVED_MIN: u8 = 4;
pub const TAG_RESERVED_MAX: u8 = 6;

const LENGTH_PREFIX_SIZE: u64 = 4;
const PUT_FIXED_FIELDS_SIZE: usize = 8 + 8 + 8;

/// A single journal item, immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueItem {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub add_time: i64,
    /// Milliseconds since the Unix epoch; `None` means the item never expires.
    pub expire_time: Option<i64>,
    pub data: Bytes,
}

/// A decoded journal record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Put(QueueItem),
    ReadHead(u64),
    ReadDone(Vec<u64>),
    /// Tags 4-6: opaque to this crate, carried through for layers above it.
    Reserved { tag: u8, payload: Bytes },
}

impl Record {
    fn tag(&self) -> u8 {
        match self {
            Record::Put(_) => TAG_PUT,
            Record::ReadHead(_) => TAG_READ_HEAD,
            Record::ReadDone(_) => TAG_READ_DONE,
            Record::Reserved { tag, .. } => *tag,
        }
    }
}

/// Outcome of attempting to read one record.
#[derive(Debug)]
pub enum DecodedRecord {
    /// A record was read; `encoded_len` is the total number of bytes it
    /// occupied on disk, including the 4-byte length prefix.
    Record { record: Record, encoded_len: u64 },
    /// No more records; the stream ended cleanly on a record boundary.
    Eof,
    /// The length prefix ran past the end of the file, or the payload was
    /// shorter than the tag requires. The caller is responsible for
    /// reporting the position at which this record began.
    Corrupted,
    /// A tag outside 1-6 was seen. Whether this is fatal (data file) or a
    /// warning to skip (reader file) is a decision for the caller.
    UnknownTag(u8),
}

/// Encodes a record into `buf`, including its length prefix.
pub fn encode_record(record: &Record, buf: &mut BytesMut) {
    let mut payload = BytesMut::new();
    match record {
        Record::Put(item) => {
            payload.put_u64_le(item.id);
            payload.put_i64_le(item.add_time);
            payload.put_i64_le(item.expire_time.unwrap_or(0));
            payload.extend_from_slice(&item.data);
        }
        Record::ReadHead(head) => payload.put_u64_le(*head),
        Record::ReadDone(ids) => {
            for id in ids {
                payload.put_u64_le(*id);
            }
        }
        Record::Reserved { payload: p, .. } => payload.extend_from_slice(p),
    }

    let length: u32 = (1 + payload.len())
        .try_into()
        .expect("record payload should never approach u32::MAX");
    buf.put_u32_le(length);
    buf.put_u8(record.tag());
    buf.extend_from_slice(&payload);
}

/// Reads a single record from `reader`.
///
/// `reader` is assumed to be positioned at a record boundary on entry.
pub async fn read_record<R>(reader: &mut R) -> Result<DecodedRecord, RecordError>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    match read_fully(reader, &mut length_buf).await? {
        Fill::Empty => return Ok(DecodedRecord::Eof),
        Fill::Partial(_) => return Ok(DecodedRecord::Corrupted),
        Fill::Full => {}
    }

    let length = u32::from_le_bytes(length_buf) as usize;
    if length == 0 {
        return Ok(DecodedRecord::Corrupted);
    }

    let mut body = vec![0u8; length];
    match read_fully(reader, &mut body).await? {
        Fill::Full => {}
        _ => return Ok(DecodedRecord::Corrupted),
    }

    let tag = body[0];
    let mut payload = Bytes::from(body).slice(1..);

    let record = match tag {
        TAG_PUT => {
            if payload.len() < PUT_FIXED_FIELDS_SIZE {
                return Ok(DecodedRecord::Corrupted);
            }
            let id = payload.get_u64_le();
            let add_time = payload.get_i64_le();
            let expire_time_raw = payload.get_i64_le();
            let data = payload;
            Record::Put(QueueItem {
                id,
                add_time,
                expire_time: if expire_time_raw == 0 {
                    None
                } else {
                    Some(expire_time_raw)
                },
                data,
            })
        }
        TAG_READ_HEAD => {
            if payload.len() < 8 {
                return Ok(DecodedRecord::Corrupted);
            }
            Record::ReadHead(payload.get_u64_le())
        }
        TAG_READ_DONE => {
            if payload.len() % 8 != 0 {
                return Ok(DecodedRecord::Corrupted);
            }
            let mut ids = Vec::with_capacity(payload.len() / 8);
            while payload.has_remaining() {
                ids.push(payload.get_u64_le());
            }
            Record::ReadDone(ids)
        }
        TAG_RESERVED_MIN..=TAG_RESERVED_MAX => Record::Reserved { tag, payload },
        other => return Ok(DecodedRecord::UnknownTag(other)),
    };

    Ok(DecodedRecord::Record {
        record,
        encoded_len: LENGTH_PREFIX_SIZE + length as u64,
    })
}

enum Fill {
    Full,
    Partial(usize),
    Empty,
}

/// Reads until `buf` is full or the reader hits EOF, distinguishing a clean
/// EOF (nothing read at all) from a truncated read (some bytes, not enough).
async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<Fill, RecordError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|source| RecordError::Io { source })?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(if filled == 0 {
        Fill::Empty
    } else if filled == buf.len() {
        Fill::Full
    } else {
        Fill::Partial(filled)
    })
}
