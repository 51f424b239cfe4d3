//! Message buffers with inline packet headers.
//!
//! A `MsgBuffer` owns a region from the slab allocator laid out as
//!
//! ```text
//! [pkthdr 0][data (max_data_size bytes)][pkthdr 1..max_num_pkts-1]
//! ```
//!
//! so a single-packet message is wire-contiguous and multi-packet messages
//! keep every packet's header adjacent to the buffer. The header area is
//! engine-owned; applications touch only the data region.

use crate::alloc::RawBuf;
use crate::packet::{PktHdr, PKT_HDR_SIZE, PKT_MAGIC};

/// Where a MsgBuffer's memory came from. Decides who frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufOrigin {
    /// Allocated at session creation, owned by a session slot, freed when
    /// the session is buried. Never freed by the user.
    Prealloc,
    /// Allocated with `alloc_msg_buffer`, freed exactly once with
    /// `free_msg_buffer`.
    Dynamic,
}

/// A message buffer: payload region plus inline per-packet headers.
///
/// An invalid buffer (null base) models allocation failure; every
/// operation other than `is_valid` requires a valid buffer.
#[derive(Debug)]
pub struct MsgBuffer {
    ptr: *mut u8,
    data_size: usize,
    max_data_size: usize,
    num_pkts: usize,
    max_num_pkts: usize,
    origin: BufOrigin,
    class: u8,
}

impl MsgBuffer {
    /// Wrap an allocator buffer. `raw` must hold at least
    /// `max_data_size + max_num_pkts * PKT_HDR_SIZE` bytes.
    pub(crate) fn from_raw(
        raw: RawBuf,
        max_data_size: usize,
        max_num_pkts: usize,
        origin: BufOrigin,
    ) -> Self {
        debug_assert!(raw.capacity() >= max_data_size + max_num_pkts * PKT_HDR_SIZE);
        let RawBuf { ptr, class } = raw;

        let buf = Self {
            ptr: ptr.as_ptr(),
            data_size: max_data_size,
            max_data_size,
            num_pkts: max_num_pkts,
            max_num_pkts,
            origin,
            class,
        };
        // Magic in the zeroth header marks the buffer as engine-created.
        unsafe { *buf.ptr.add(PKT_HDR_SIZE - 1) = PKT_MAGIC };
        buf
    }

    /// The invalid buffer, returned when allocation fails.
    pub fn invalid() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            data_size: 0,
            max_data_size: 0,
            num_pkts: 0,
            max_num_pkts: 0,
            origin: BufOrigin::Dynamic,
            class: 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.ptr.is_null()
    }

    /// Check the magic sentinel in the zeroth header.
    #[inline]
    pub fn check_magic(&self) -> bool {
        self.is_valid() && unsafe { *self.ptr.add(PKT_HDR_SIZE - 1) } == PKT_MAGIC
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.origin == BufOrigin::Dynamic
    }

    /// The payload region, `data_size` bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        debug_assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts(self.ptr.add(PKT_HDR_SIZE), self.data_size) }
    }

    /// The payload region, mutable.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(PKT_HDR_SIZE), self.data_size) }
    }

    /// The full payload capacity, mutable. Used for staging a response
    /// before its final size is known.
    #[inline]
    pub(crate) fn data_full_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.is_valid());
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(PKT_HDR_SIZE), self.max_data_size) }
    }

    /// Shrink to `new_size` bytes spanning `new_num_pkts` packets. Does not
    /// touch memory; payload bytes within `[0, new_size)` are preserved.
    pub(crate) fn set_data_size(&mut self, new_size: usize, new_num_pkts: usize) {
        debug_assert!(self.is_valid());
        debug_assert!(new_size <= self.max_data_size);
        debug_assert!(new_num_pkts <= self.max_num_pkts);
        self.data_size = new_size;
        self.num_pkts = new_num_pkts;
    }

    /// Byte offset of packet `i`'s header. Header 0 precedes the data;
    /// later headers follow it.
    #[inline]
    fn pkt_hdr_offset(&self, i: usize) -> usize {
        debug_assert!(i < self.max_num_pkts);
        if i == 0 {
            0
        } else {
            PKT_HDR_SIZE + self.max_data_size + (i - 1) * PKT_HDR_SIZE
        }
    }

    /// Read packet `i`'s header.
    pub(crate) fn pkt_hdr(&self, i: usize) -> Option<PktHdr> {
        debug_assert!(self.is_valid());
        let off = self.pkt_hdr_offset(i);
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.add(off), PKT_HDR_SIZE) };
        PktHdr::from_bytes(bytes)
    }

    /// Stamp packet `i`'s header.
    pub(crate) fn set_pkt_hdr(&mut self, i: usize, hdr: &PktHdr) {
        debug_assert!(self.is_valid());
        let off = self.pkt_hdr_offset(i);
        let bytes = hdr.to_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(off), PKT_HDR_SIZE)
        };
    }

    /// Payload slice of packet `i`.
    pub(crate) fn pkt_payload(&self, i: usize, max_data_per_pkt: usize) -> &[u8] {
        let start = i * max_data_per_pkt;
        let end = self.data_size.min(start + max_data_per_pkt);
        &self.data()[start..end]
    }

    /// Detach the backing memory for return to the allocator, leaving the
    /// buffer invalid. `None` if already invalid.
    pub(crate) fn take_raw(&mut self) -> Option<RawBuf> {
        let ptr = std::ptr::NonNull::new(self.ptr)?;
        self.ptr = std::ptr::null_mut();
        Some(RawBuf {
            ptr,
            class: self.class,
        })
    }
}

// Buffers move to background workers; the backing memory lives in the
// allocator, which outlives every worker.
unsafe impl Send for MsgBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HugeAllocator;
    use crate::packet::{pkts_for, PktType};

    fn alloc_msgbuf(a: &mut HugeAllocator, max_data: usize, mdpp: usize) -> MsgBuffer {
        let pkts = pkts_for(max_data, mdpp);
        let raw = a.alloc(max_data + pkts * PKT_HDR_SIZE).unwrap();
        MsgBuffer::from_raw(raw, max_data, pkts, BufOrigin::Dynamic)
    }

    #[test]
    fn test_msg_buffer_basic() {
        let mut a = HugeAllocator::new(4 * 1024 * 1024);
        let mut m = alloc_msgbuf(&mut a, 1000, 1024);
        assert!(m.is_valid());
        assert!(m.check_magic());
        assert_eq!(m.data_size(), 1000);
        assert_eq!(m.num_pkts(), 1);

        m.data_mut().fill(0xAB);
        assert!(m.data().iter().all(|&b| b == 0xAB));
        a.free(m.take_raw().unwrap());
    }

    #[test]
    fn test_msg_buffer_resize_preserves_prefix() {
        let mut a = HugeAllocator::new(4 * 1024 * 1024);
        let mut m = alloc_msgbuf(&mut a, 4000, 1024);
        assert_eq!(m.num_pkts(), 4);
        for (i, b) in m.data_mut().iter_mut().enumerate() {
            *b = i as u8;
        }

        m.set_data_size(100, 1);
        assert_eq!(m.data_size(), 100);
        assert_eq!(m.num_pkts(), 1);
        for (i, b) in m.data().iter().enumerate() {
            assert_eq!(*b, i as u8);
        }
        a.free(m.take_raw().unwrap());
    }

    #[test]
    fn test_msg_buffer_pkt_headers() {
        let mut a = HugeAllocator::new(4 * 1024 * 1024);
        let mut m = alloc_msgbuf(&mut a, 3000, 1024);
        assert_eq!(m.num_pkts(), 3);

        for i in 0..3 {
            let hdr = PktHdr::new(9, 3000, 7, PktType::Req, i as u16, 0x88);
            m.set_pkt_hdr(i, &hdr);
        }
        for i in 0..3 {
            let hdr = m.pkt_hdr(i).unwrap();
            assert_eq!(hdr.pkt_num(), i as u16);
            assert_eq!(hdr.msg_size(), 3000);
            assert_eq!(hdr.req_num(), 0x88);
        }
        // Headers must not overlap the payload.
        m.data_mut().fill(0xFF);
        for i in 0..3 {
            assert_eq!(m.pkt_hdr(i).unwrap().msg_size(), 3000);
        }
        a.free(m.take_raw().unwrap());
    }

    #[test]
    fn test_msg_buffer_pkt_payload_slices() {
        let mut a = HugeAllocator::new(4 * 1024 * 1024);
        let mut m = alloc_msgbuf(&mut a, 2500, 1024);
        m.data_mut().fill(1);
        assert_eq!(m.pkt_payload(0, 1024).len(), 1024);
        assert_eq!(m.pkt_payload(1, 1024).len(), 1024);
        assert_eq!(m.pkt_payload(2, 1024).len(), 452);
        a.free(m.take_raw().unwrap());
    }

    #[test]
    fn test_invalid_buffer() {
        let m = MsgBuffer::invalid();
        assert!(!m.is_valid());
        assert!(!m.check_magic());
    }
}
