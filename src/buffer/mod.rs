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

//! Zero-copy buffered message pipeline.
//!
//! Two layers: [`pool`] owns the physical buffers (fixed-size, 4 KiB-aligned,
//! reference-counted units with a three-tier free list), and [`msg`] builds
//! scatter-gather views over them. Every request and response in the server
//! flows through these types.

pub mod msg;
pub mod pool;

pub use msg::Msg;
pub use pool::{BufRef, BufferPool};

/// Abort the process with a diagnostic. Reserved for broken pipeline
/// invariants (double free, retain-on-free, out-of-bounds view); no recovery
/// can restore a pool once one of these fires.
pub(crate) fn die(msg: &str) -> ! {
    eprintln!("[FATAL] buffer: {msg}");
    std::process::abort();
}
