//! Typed record model over the flat ordered keyspace.
//!
//! Every data structure (string, list, hash, set, sorted set) is mapped onto
//! the engine's single byte-string namespace. A record key is the tuple
//! `(chunk_id, db_id, record type, primary key, secondary key)`; the encoding
//! preserves tuple order lexicographically so that all records of one
//! container are adjacent and reachable by prefix scan.
//!
//! ## Key wire format
//!
//! ```text
//!   [chunk_id: u32 BE][db_id: u32 BE][tag: u8][esc(primary)][0x00 0x01][secondary]
//! ```
//!
//! A literal `0x00` inside the primary key is escaped to `0x00 0xFF`; the
//! terminator `0x00 0x01` sorts below every escaped byte, which is what keeps
//! encoded order equal to tuple order. The secondary key is the final field
//! and is stored raw.
//!
//! ## Value wire format
//!
//! ```text
//!   [ttl_millis: u64 LE][payload]
//! ```
//!
//! `ttl_millis == 0` means no expiration; otherwise it is an absolute
//! wall-clock deadline in milliseconds since the epoch.

use shrike_common::{ShrikeError, ShrikeResult};

/// Reserved separator byte inside encoded keys.
const SEP: u8 = 0x00;
/// Follows `SEP` to terminate the primary key.
const SEP_END: u8 = 0x01;
/// Follows `SEP` to represent a literal zero byte of the primary key.
const SEP_LITERAL: u8 = 0xFF;

/// Fixed-width prefix before the primary key: chunk + db + tag.
const KEY_HDR_LEN: usize = 4 + 4 + 1;
/// Value header: the TTL field.
const VALUE_HDR_LEN: usize = 8;

/// Closed set of record kinds.
///
/// Tag bytes ascend in declaration order, so the derived `Ord` matches byte
/// order in the encoded keyspace. Tags are persisted and must stay stable
/// across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    /// Scalar string value.
    Kv,
    /// List header record.
    ListMeta,
    /// One list element.
    ListEle,
    /// Hash header record.
    HashMeta,
    /// One hash field.
    HashEle,
    /// Set header record.
    SetMeta,
    /// One set member.
    SetEle,
    /// Sorted-set header record.
    ZsetMeta,
    /// One sorted-set member.
    ZsetEle,
}

impl RecordType {
    /// The meta kinds probed by type-agnostic commands, in the fixed order
    /// the probe uses. A user key lives under at most one of these.
    pub const META_KINDS: [RecordType; 5] = [
        RecordType::Kv,
        RecordType::ListMeta,
        RecordType::HashMeta,
        RecordType::SetMeta,
        RecordType::ZsetMeta,
    ];

    /// Single-byte tag used in the encoded key.
    pub fn tag(self) -> u8 {
        match self {
            RecordType::Kv => b'a',
            RecordType::ListMeta => b'b',
            RecordType::ListEle => b'c',
            RecordType::HashMeta => b'd',
            RecordType::HashEle => b'e',
            RecordType::SetMeta => b'f',
            RecordType::SetEle => b'g',
            RecordType::ZsetMeta => b'h',
            RecordType::ZsetEle => b'i',
        }
    }

    pub fn from_tag(b: u8) -> Option<Self> {
        match b {
            b'a' => Some(RecordType::Kv),
            b'b' => Some(RecordType::ListMeta),
            b'c' => Some(RecordType::ListEle),
            b'd' => Some(RecordType::HashMeta),
            b'e' => Some(RecordType::HashEle),
            b'f' => Some(RecordType::SetMeta),
            b'g' => Some(RecordType::SetEle),
            b'h' => Some(RecordType::ZsetMeta),
            b'i' => Some(RecordType::ZsetEle),
            _ => None,
        }
    }

    /// True for header records (the TTL carriers).
    pub fn is_meta_kind(self) -> bool {
        matches!(
            self,
            RecordType::Kv
                | RecordType::ListMeta
                | RecordType::HashMeta
                | RecordType::SetMeta
                | RecordType::ZsetMeta
        )
    }

    /// The element kind subordinate to a composite meta kind.
    pub fn element_kind(self) -> Option<RecordType> {
        match self {
            RecordType::ListMeta => Some(RecordType::ListEle),
            RecordType::HashMeta => Some(RecordType::HashEle),
            RecordType::SetMeta => Some(RecordType::SetEle),
            RecordType::ZsetMeta => Some(RecordType::ZsetEle),
            _ => None,
        }
    }
}

/// Logical key of one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordKey {
    pub chunk_id: u32,
    pub db_id: u32,
    pub rtype: RecordType,
    pub primary_key: Vec<u8>,
    pub secondary_key: Vec<u8>,
}

impl RecordKey {
    pub fn new(
        chunk_id: u32,
        db_id: u32,
        rtype: RecordType,
        primary_key: impl Into<Vec<u8>>,
        secondary_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            chunk_id,
            db_id,
            rtype,
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
        }
    }

    /// Encode to the storage key. Lexicographic order of encodings equals
    /// tuple order of `(chunk_id, db_id, rtype, primary_key, secondary_key)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(KEY_HDR_LEN + self.primary_key.len() + 2 + self.secondary_key.len());
        buf.extend_from_slice(&self.chunk_id.to_be_bytes());
        buf.extend_from_slice(&self.db_id.to_be_bytes());
        buf.push(self.rtype.tag());
        escape_into(&self.primary_key, &mut buf);
        buf.push(SEP);
        buf.push(SEP_END);
        buf.extend_from_slice(&self.secondary_key);
        buf
    }

    /// Decode a storage key produced by [`RecordKey::encode`].
    pub fn decode(raw: &[u8]) -> ShrikeResult<Self> {
        if raw.len() < KEY_HDR_LEN + 2 {
            return Err(ShrikeError::codec("record key too short"));
        }
        let chunk_id = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        let db_id = u32::from_be_bytes(raw[4..8].try_into().unwrap());
        let rtype = RecordType::from_tag(raw[8])
            .ok_or_else(|| ShrikeError::codec(format!("unknown record tag {:#04x}", raw[8])))?;

        let mut primary_key = Vec::new();
        let mut i = KEY_HDR_LEN;
        loop {
            match raw.get(i) {
                None => return Err(ShrikeError::codec("record key missing terminator")),
                Some(&SEP) => match raw.get(i + 1) {
                    Some(&SEP_END) => {
                        i += 2;
                        break;
                    }
                    Some(&SEP_LITERAL) => {
                        primary_key.push(SEP);
                        i += 2;
                    }
                    _ => return Err(ShrikeError::codec("bad escape in record key")),
                },
                Some(&b) => {
                    primary_key.push(b);
                    i += 1;
                }
            }
        }
        Ok(Self {
            chunk_id,
            db_id,
            rtype,
            primary_key,
            secondary_key: raw[i..].to_vec(),
        })
    }

    /// Encoded bytes through the terminator. Every record sharing this key's
    /// `(chunk, db, type, primary)` — the record itself and, for an element
    /// kind, each of its container's entries — starts with these bytes.
    pub fn prefix(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_HDR_LEN + self.primary_key.len() + 2);
        buf.extend_from_slice(&self.chunk_id.to_be_bytes());
        buf.extend_from_slice(&self.db_id.to_be_bytes());
        buf.push(self.rtype.tag());
        escape_into(&self.primary_key, &mut buf);
        buf.push(SEP);
        buf.push(SEP_END);
        buf
    }
}

/// Cursor-seek prefix covering every key of `rtype` whose primary key starts
/// with `partial`. Unlike [`RecordKey::prefix`] there is no terminator, so a
/// partial primary key matches all its extensions.
pub fn seek_prefix(chunk_id: u32, db_id: u32, rtype: RecordType, partial: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_HDR_LEN + partial.len());
    buf.extend_from_slice(&chunk_id.to_be_bytes());
    buf.extend_from_slice(&db_id.to_be_bytes());
    buf.push(rtype.tag());
    escape_into(partial, &mut buf);
    buf
}

fn escape_into(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        if b == SEP {
            out.push(SEP);
            out.push(SEP_LITERAL);
        } else {
            out.push(b);
        }
    }
}

/// Payload plus expiration deadline of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordValue {
    pub payload: Vec<u8>,
    pub ttl_millis: u64,
}

impl RecordValue {
    pub fn new(payload: impl Into<Vec<u8>>, ttl_millis: u64) -> Self {
        Self {
            payload: payload.into(),
            ttl_millis,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VALUE_HDR_LEN + self.payload.len());
        buf.extend_from_slice(&self.ttl_millis.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(raw: &[u8]) -> ShrikeResult<Self> {
        if raw.len() < VALUE_HDR_LEN {
            return Err(ShrikeError::codec("record value shorter than ttl header"));
        }
        Ok(Self {
            ttl_millis: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            payload: raw[VALUE_HDR_LEN..].to_vec(),
        })
    }

    /// Rewrite only the TTL field.
    pub fn set_ttl(&mut self, ttl_millis: u64) {
        self.ttl_millis = ttl_millis;
    }

    /// Past due at `now_millis`? A zero TTL never expires.
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.ttl_millis != 0 && self.ttl_millis <= now_millis
    }
}
