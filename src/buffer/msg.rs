// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Scatter-gather message views over pool buffers.
//!
//! A [`Msg`] is an ordered sequence of `(unit, offset, length)` segments,
//! each holding one reference on its unit. Appending a slice of an existing
//! unit is the zero-copy path; `copy_in` fills fresh units from a byte
//! slice; `io_slices` exposes the segments to vectored socket writes without
//! linearizing.

use std::io::IoSlice;
use std::ptr;
use std::slice;

use super::die;
use super::pool::{BufRef, BufferPool};

struct Segment {
    buf: BufRef,
    offset: usize,
    len: usize,
}

/// Ordered view over buffer-unit slices; the request/response carrier.
#[derive(Default)]
pub struct Msg {
    segments: Vec<Segment>,
    total_len: usize,
    /// True when the last segment was filled by this view's own `copy_in`,
    /// i.e. the physical tail of its unit belongs to us and in-place
    /// extension is safe. Any `append_unit` clears it: a borrowed slice may
    /// share its unit with another view, and writing past the slice would
    /// scribble over bytes that view can see.
    tail_owned: bool,
}

impl Msg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_length(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Append a slice of an existing unit without copying. Adds a reference
    /// on the unit. An out-of-bounds slice aborts; the unit is known BUSY
    /// because a live `BufRef` guarantees it.
    pub fn append_unit(&mut self, buf: &BufRef, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        if offset + len > buf.capacity() {
            die("view slice out of unit bounds");
        }
        self.segments.push(Segment {
            buf: buf.clone(),
            offset,
            len,
        });
        self.total_len += len;
        self.tail_owned = false;
    }

    /// Append `len` bytes of `src`, starting `skip` bytes in, as zero-copy
    /// slices of `src`'s segments.
    pub fn append_view(&mut self, src: &Msg, mut skip: usize, mut len: usize) {
        for seg in &src.segments {
            if len == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(len);
            self.append_unit(&seg.buf, seg.offset + skip, take);
            skip = 0;
            len -= take;
        }
    }

    /// Append `src` by copying, first into the unused physical tail of the
    /// last segment when this view owns it, then into fresh units from the
    /// pool. Returns false when the pool runs dry mid-copy; the bytes
    /// appended so far remain in the view and the caller decides whether to
    /// clear or retry.
    pub fn copy_in(&mut self, pool: &BufferPool, mut src: &[u8]) -> bool {
        if src.is_empty() {
            return true;
        }

        if self.tail_owned {
            if let Some(last) = self.segments.last_mut() {
                let used = last.offset + last.len;
                let avail = last.buf.capacity() - used;
                if avail > 0 {
                    let take = avail.min(src.len());
                    unsafe {
                        ptr::copy_nonoverlapping(src.as_ptr(), last.buf.data().add(used), take);
                    }
                    last.len += take;
                    self.total_len += take;
                    src = &src[take..];
                }
            }
        }

        while !src.is_empty() {
            let Some(buf) = pool.get() else {
                return false;
            };
            let take = src.len().min(buf.capacity());
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), buf.data(), take);
            }
            // The fresh unit's single reference moves into the segment.
            self.segments.push(Segment {
                buf,
                offset: 0,
                len: take,
            });
            self.total_len += take;
            self.tail_owned = true;
            src = &src[take..];
        }
        true
    }

    /// Linearize up to `dst.len()` bytes into `dst`; returns the count
    /// actually copied.
    pub fn copy_out(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for seg in &self.segments {
            if copied == dst.len() {
                break;
            }
            let take = seg.len.min(dst.len() - copied);
            unsafe {
                ptr::copy_nonoverlapping(
                    seg.buf.data().add(seg.offset),
                    dst.as_mut_ptr().add(copied),
                    take,
                );
            }
            copied += take;
        }
        copied
    }

    /// Linearize the whole view into a fresh Vec.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_len];
        let n = self.copy_out(&mut out);
        out.truncate(n);
        out
    }

    /// The segments as a scatter-gather list for vectored writes. No copy;
    /// the slices borrow from the view.
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.io_slices_from(0, max)
    }

    /// Scatter-gather list starting `skip` bytes into the view, for
    /// resuming a partial vectored write.
    pub fn io_slices_from(&self, mut skip: usize, max: usize) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(self.segments.len().min(max));
        for seg in &self.segments {
            if out.len() == max {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let ptr = unsafe { seg.buf.data().add(seg.offset + skip) };
            let len = seg.len - skip;
            out.push(IoSlice::new(unsafe { slice::from_raw_parts(ptr, len) }));
            skip = 0;
        }
        out
    }

    /// Release every segment's reference, in order, and reset the view.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.total_len = 0;
        self.tail_owned = false;
    }
}
