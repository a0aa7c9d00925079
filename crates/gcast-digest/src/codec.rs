//! Binary wire form of a [`Digest`].
//!
//! ```text
//! count:u32
//! count × { member (tag:u8, address, port:u16), low:i64, high:i64, high_seen:i64 }
//! ```
//!
//! All integers are big-endian. [`Digest::serialized_size`] is exact so
//! callers can size buffers before encoding.
//!
//! The serde representation of a digest is this byte string, so digests
//! embedded in postcard messages keep the same layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gcast_types::MemberId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Digest, DigestEntry, DigestError};

/// Size of the `count` header.
const HEADER_LEN: usize = 4;
/// Size of the three seqno fields of one entry.
const SEQNOS_LEN: usize = 3 * 8;

impl Digest {
    /// Exact number of bytes [`Digest::encode`] produces.
    pub fn serialized_size(&self) -> usize {
        HEADER_LEN
            + self
                .iter()
                .map(|(member, _)| member.encoded_len() + SEQNOS_LEN)
                .sum::<usize>()
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode(&self) -> Result<Bytes, DigestError> {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.encode_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoding to `buf`.
    ///
    /// Fails without writing anything if a seqno does not fit the signed
    /// wire fields.
    pub fn encode_to<B: BufMut>(&self, buf: &mut B) -> Result<(), DigestError> {
        let count = u32::try_from(self.len()).map_err(|_| DigestError::TooManyEntries(self.len()))?;
        let mut fields = Vec::with_capacity(self.len());
        for (member, entry) in self.iter() {
            fields.push((
                member,
                wire(entry.low, "low")?,
                wire(entry.high, "high")?,
                wire(entry.high_seen, "high_seen")?,
            ));
        }

        buf.put_u32(count);
        for (member, low, high, high_seen) in fields {
            member.encode(buf);
            buf.put_i64(low);
            buf.put_i64(high);
            buf.put_i64(high_seen);
        }
        Ok(())
    }

    /// Decode a complete digest. Trailing bytes are an error.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, DigestError> {
        let digest = Self::decode_from(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(DigestError::TrailingBytes(bytes.len()));
        }
        Ok(digest)
    }

    /// Decode a digest from the front of `buf`, leaving the rest unread.
    pub fn decode_from<B: Buf>(buf: &mut B) -> Result<Self, DigestError> {
        ensure(buf, HEADER_LEN)?;
        let count = buf.get_u32() as usize;
        // Cap the preallocation: a corrupt count must not reserve gigabytes.
        let mut digest = Digest::with_capacity(count.min(buf.remaining() / SEQNOS_LEN));

        for _ in 0..count {
            let member = MemberId::decode(buf)?;
            ensure(buf, SEQNOS_LEN)?;
            let low = seqno(buf.get_i64(), "low")?;
            let high = seqno(buf.get_i64(), "high")?;
            let high_seen = seqno(buf.get_i64(), "high_seen")?;
            if digest.contains(&member) {
                return Err(DigestError::DuplicateMember(member));
            }
            digest.add_entry(member, DigestEntry::new(low, high, high_seen));
        }
        Ok(digest)
    }
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), DigestError> {
    if buf.remaining() < needed {
        return Err(DigestError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn wire(value: u64, field: &'static str) -> Result<i64, DigestError> {
    i64::try_from(value).map_err(|_| DigestError::SeqnoOverflow { field, value })
}

fn seqno(value: i64, field: &'static str) -> Result<u64, DigestError> {
    u64::try_from(value).map_err(|_| DigestError::NegativeSeqno { field, value })
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.encode().map_err(serde::ser::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Digest::decode(&bytes).map_err(serde::de::Error::custom)
    }
}
