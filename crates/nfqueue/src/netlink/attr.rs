//! Netlink attribute (nlattr) handling.

use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4; // nla_align(size_of::<NlAttr>())

/// Largest payload that fits the 16-bit nla_len.
pub const NLA_MAX_PAYLOAD: usize = u16::MAX as usize - NLA_HDRLEN;

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    ///
    /// Fails when `data_len` exceeds [`NLA_MAX_PAYLOAD`].
    pub fn new(attr_type: u16, data_len: usize) -> Result<Self> {
        let nla_len = u16::try_from(NLA_HDRLEN + data_len).map_err(|_| {
            Error::InvalidAttribute(format!(
                "attribute {} payload of {} bytes exceeds {}",
                attr_type & NLA_TYPE_MASK,
                data_len,
                NLA_MAX_PAYLOAD
            ))
        })?;
        Ok(Self {
            nla_len,
            nla_type: attr_type,
        })
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Check if this is a nested attribute.
    pub fn is_nested(&self) -> bool {
        self.nla_type & NLA_F_NESTED != 0
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Iterator over netlink attributes in a buffer.
///
/// Iteration stops at the first malformed record. Callers must consult
/// [`finish`](Self::finish) once the loop is over: a stop caused by a
/// truncated header or a length overrunning the buffer is reported there,
/// not by the iterator itself.
pub struct AttrIter<'a> {
    data: &'a [u8],
    error: Option<Error>,
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, error: None }
    }

    /// Report whether iteration ended on a malformed record.
    pub fn finish(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: Error) -> Option<(u16, &'a [u8])> {
        self.error = Some(error);
        self.data = &[];
        None
    }
}

impl<'a> Iterator for AttrIter<'a> {
    /// Returns (attribute type, payload data).
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() || self.error.is_some() {
            return None;
        }
        if self.data.len() < NLA_HDRLEN {
            // Anything shorter than a header is alignment padding.
            self.data = &[];
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => *a,
            Err(e) => return self.fail(e),
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN {
            return self.fail(Error::InvalidAttribute(format!(
                "attribute length {} shorter than header",
                len
            )));
        }
        if len > self.data.len() {
            return self.fail(Error::Truncated {
                expected: len,
                actual: self.data.len(),
            });
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned_len = nla_align(len);

        // Move to next attribute
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some((attr.kind(), payload))
    }
}

/// Serialized sequence of attributes.
///
/// Each record is written as a native-endian nlattr header followed by the
/// payload, padded to [`NLA_ALIGNTO`]. No validation is applied to payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrBuf {
    buf: Vec<u8>,
}

impl AttrBuf {
    /// Create an empty attribute buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if no attribute has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append an attribute with the given type and data.
    ///
    /// Nothing is written when `data` is longer than [`NLA_MAX_PAYLOAD`].
    pub fn push(&mut self, attr_type: u16, data: &[u8]) -> Result<()> {
        let attr = NlAttr::new(attr_type, data.len())?;
        self.put(attr, data);
        Ok(())
    }

    /// Append a u32 attribute (big endian / network order).
    pub fn push_u32_be(&mut self, attr_type: u16, value: u32) {
        let attr = NlAttr {
            nla_len: (NLA_HDRLEN + 4) as u16,
            nla_type: attr_type,
        };
        self.put(attr, &value.to_be_bytes());
    }

    /// Append `inner` as the payload of a nested attribute.
    pub fn push_nested(&mut self, attr_type: u16, inner: &AttrBuf) -> Result<()> {
        self.push(attr_type | NLA_F_NESTED, inner.as_bytes())
    }

    fn put(&mut self, attr: NlAttr, data: &[u8]) {
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Get the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the buffer, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Helper functions for extracting typed values from attribute payloads.
///
/// nfnetlink payloads are in network byte order.
pub mod get {
    use super::*;

    /// Extract a u16 value (big endian / network order).
    pub fn u16_be(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (big endian / network order).
    pub fn u32_be(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        // Find null terminator or use whole buffer
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))
    }
}
