//! Log records and wire framing.
//!
//! The first payload byte identifies the record kind. A transaction
//! record's payload IS its Arrow IPC stream: the stream's leading
//! continuation marker (`0xFF`) doubles as the header, so no extra prefix
//! is needed. `FlushChunk` is `[0x02][i64 LE]`. `TriesAdded` uses the
//! reserved byte `0x03` with a length-prefixed entry list.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::LogError;

/// Offset assigned by the log on append; synonymous with tx-id for
/// transaction records.
pub type LogOffset = i64;

/// Header byte of a transaction record (the IPC continuation marker).
pub const HEADER_TX: u8 = 0xFF;
/// Header byte of a flush-chunk control record.
pub const HEADER_FLUSH_CHUNK: u8 = 0x02;
/// Header byte of a tries-added control record.
pub const HEADER_TRIES_ADDED: u8 = 0x03;

/// A trie added to a table, announced through the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieDetails {
    /// Table the trie belongs to.
    pub table: String,
    /// Storage key of the trie.
    pub trie_key: String,
}

/// Payload variants of a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogMessage {
    /// A serialised transaction envelope (a complete Arrow IPC stream).
    Tx(Bytes),
    /// Request a durable chunk boundary. Carries the chunk tx-id the
    /// requester last observed (`-1` when none), so replaying indexers can
    /// ignore redundant flush signals.
    FlushChunk(i64),
    /// Tries added by a peer, to be registered with the trie catalog.
    TriesAdded(Vec<TrieDetails>),
}

impl LogMessage {
    /// Encodes the message into its framed payload bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Tx(payload) => payload.clone(),
            Self::FlushChunk(expected_chunk_tx_id) => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(HEADER_FLUSH_CHUNK);
                buf.put_i64_le(*expected_chunk_tx_id);
                buf.freeze()
            }
            Self::TriesAdded(entries) => {
                let mut buf = BytesMut::new();
                buf.put_u8(HEADER_TRIES_ADDED);
                buf.put_u32_le(u32::try_from(entries.len()).unwrap_or(u32::MAX));
                for entry in entries {
                    put_string(&mut buf, &entry.table);
                    put_string(&mut buf, &entry.trie_key);
                }
                buf.freeze()
            }
        }
    }

    /// Decodes framed payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Corrupt`] for an unknown header byte or a
    /// truncated payload.
    pub fn decode(payload: Bytes) -> Result<Self, LogError> {
        match payload.first() {
            Some(&HEADER_TX) => Ok(Self::Tx(payload)),
            Some(&HEADER_FLUSH_CHUNK) => {
                let body: [u8; 8] = payload
                    .get(1..9)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| LogError::Corrupt("short flush-chunk record".into()))?;
                Ok(Self::FlushChunk(i64::from_le_bytes(body)))
            }
            Some(&HEADER_TRIES_ADDED) => decode_tries_added(&payload[1..]),
            Some(other) => Err(LogError::Corrupt(format!(
                "unknown record header byte {other:#04x}"
            ))),
            None => Err(LogError::Corrupt("empty record payload".into())),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(u16::try_from(s.len()).unwrap_or(u16::MAX));
    buf.put_slice(s.as_bytes());
}

fn decode_tries_added(mut body: &[u8]) -> Result<LogMessage, LogError> {
    fn take<'a>(body: &mut &'a [u8], n: usize) -> Result<&'a [u8], LogError> {
        if body.len() < n {
            return Err(LogError::Corrupt("short tries-added record".into()));
        }
        let (head, tail) = body.split_at(n);
        *body = tail;
        Ok(head)
    }
    fn take_string(body: &mut &[u8]) -> Result<String, LogError> {
        let len_bytes: [u8; 2] = take(body, 2)?.try_into().expect("two bytes");
        let len = usize::from(u16::from_le_bytes(len_bytes));
        String::from_utf8(take(body, len)?.to_vec())
            .map_err(|_| LogError::Corrupt("non-utf8 trie entry".into()))
    }

    let count_bytes: [u8; 4] = take(&mut body, 4)?.try_into().expect("four bytes");
    let count = u32::from_le_bytes(count_bytes) as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        entries.push(TrieDetails {
            table: take_string(&mut body)?,
            trie_key: take_string(&mut body)?,
        });
    }
    Ok(LogMessage::TriesAdded(entries))
}

/// One record of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Offset assigned on append; dense and strictly increasing.
    pub offset: LogOffset,
    /// Instant the log accepted the record.
    pub timestamp: DateTime<Utc>,
    /// The payload.
    pub message: LogMessage,
}
