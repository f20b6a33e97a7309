//! Packet buffer handed between the outer network pipeline and ESP
//!
//! A [`Packet`] is a contiguous byte buffer holding the whole datagram,
//! outer IP header included. The outer pipeline tells the transform where
//! the ESP header starts (`skip`) and where the next-protocol field of the
//! outer header lives (`protoff`); everything else is byte offsets into
//! this buffer.

use super::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

/// IP protocol number of ESP
pub const IPPROTO_ESP: u8 = 50;

/// IP protocol number meaning "no next header" (RFC 4303 dummy packets)
pub const IPPROTO_NONE: u8 = 59;

/// Largest datagram either address family can carry
pub const IP_MAXPACKET: usize = 65535;

/// Address family of the packet being transformed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4
    Inet,
    /// IPv6
    Inet6,
}

impl AddressFamily {
    /// Maximum packet size for this family
    pub fn max_packet_size(self) -> usize {
        match self {
            AddressFamily::Inet => IP_MAXPACKET,
            // Jumbograms are not supported
            AddressFamily::Inet6 => IP_MAXPACKET,
        }
    }
}

/// Mutable packet buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: BytesMut,
    family: AddressFamily,
}

impl Packet {
    /// Create packet from raw bytes
    pub fn from_slice(family: AddressFamily, data: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(data),
            family,
        }
    }

    /// Create packet taking ownership of an existing buffer
    pub fn from_bytes_mut(family: AddressFamily, buf: BytesMut) -> Self {
        Self { buf, family }
    }

    /// Address family
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the packet holds no bytes
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Packet contents
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable packet contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Open a zero-filled gap of `len` bytes at `offset`
    pub fn insert(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, 0)?;

        let tail = self.buf.split_off(offset);
        self.buf.resize(offset + len, 0);
        self.buf.unsplit(tail);
        Ok(())
    }

    /// Cut `len` bytes out of the packet starting at `offset`
    pub fn remove(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check_range(offset, len)?;

        let mut tail = self.buf.split_off(offset);
        tail.advance(len);
        self.buf.unsplit(tail);
        Ok(())
    }

    /// Shorten the packet to `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Append bytes at the tail
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Read one byte
    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        self.check_range(offset, 1)?;
        Ok(self.buf[offset])
    }

    /// Overwrite one byte
    pub fn write_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.check_range(offset, 1)?;
        self.buf[offset] = value;
        Ok(())
    }

    /// Read a big-endian u32
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a big-endian u32
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_slice(offset, &value.to_be_bytes())
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(&self.buf[offset..offset + len])
    }

    /// Copy `data` into the packet at `offset`
    pub fn write_slice(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Freeze into immutable bytes
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let required = offset.checked_add(len).ok_or(Error::BufferTooShort {
            required: usize::MAX,
            available: self.buf.len(),
        })?;

        if required > self.buf.len() {
            return Err(Error::BufferTooShort {
                required,
                available: self.buf.len(),
            });
        }
        Ok(())
    }
}
