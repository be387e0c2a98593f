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

//! Socket-to-message framing: read one HTTP request into a [`Msg`].

use std::io::Read;

use crate::buffer::{BufferPool, Msg};

use super::HttpError;

/// Header section must terminate within this many bytes.
pub const MAX_HEADER: usize = 65536;
/// Largest accepted Content-Length.
pub const MAX_CONTENT_LENGTH: i64 = 1024 * 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// What the framer learned about the request it read.
#[derive(Debug, Clone, Copy)]
pub struct FramedRequest {
    /// Total bytes absorbed into the message.
    pub total_read: usize,
    /// Offset of the first body byte (just past the blank line).
    pub header_len: usize,
    /// Declared Content-Length; 0 when the header is absent.
    pub content_length: i64,
}

/// Read from `stream` into `msg` until the end-of-headers marker, then until
/// the declared body has been fully absorbed. Fails fast on oversized
/// headers or bodies and on pool exhaustion.
pub fn read_request<S: Read>(
    stream: &mut S,
    pool: &BufferPool,
    msg: &mut Msg,
) -> Result<FramedRequest, HttpError> {
    msg.clear();
    let mut chunk = [0u8; READ_CHUNK];
    let mut total = 0usize;

    let header_len = loop {
        if total >= MAX_HEADER {
            return Err(HttpError::HeadersTooLarge(MAX_HEADER));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(if total == 0 {
                HttpError::ConnectionClosed
            } else {
                HttpError::Truncated
            });
        }
        if !msg.copy_in(pool, &chunk[..n]) {
            return Err(HttpError::PoolExhausted);
        }
        total += n;
        let bytes = msg.to_vec();
        if let Some(pos) = find_header_end(&bytes) {
            break pos;
        }
    };

    let head = msg.to_vec();
    let content_length = match scan_content_length(&head[..header_len]) {
        Some(cl) if cl > MAX_CONTENT_LENGTH => return Err(HttpError::BodyTooLarge(cl)),
        Some(cl) => cl,
        None => 0,
    };

    let want = header_len + content_length as usize;
    while total < want {
        let to_read = (want - total).min(READ_CHUNK);
        let n = stream.read(&mut chunk[..to_read])?;
        if n == 0 {
            return Err(HttpError::Truncated);
        }
        if !msg.copy_in(pool, &chunk[..n]) {
            return Err(HttpError::PoolExhausted);
        }
        total += n;
    }

    Ok(FramedRequest {
        total_read: total,
        header_len,
        content_length,
    })
}

/// Offset just past the first `CR LF CR LF`, if present.
fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Case-insensitive Content-Length scan over the header section. Digit runs
/// are accepted and everything after the first non-digit is ignored, the way
/// the rest of the numeric query parsing behaves.
fn scan_content_length(head: &[u8]) -> Option<i64> {
    const KEY: &[u8] = b"content-length:";
    for line in head.split(|&b| b == b'\n') {
        if line.len() < KEY.len() || !line[..KEY.len()].eq_ignore_ascii_case(KEY) {
            continue;
        }
        let rest = &line[KEY.len()..];
        let mut value = 0i64;
        let mut seen = false;
        for &b in rest {
            match b {
                b' ' | b'\t' if !seen => continue,
                b'0'..=b'9' => {
                    seen = true;
                    value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
                }
                _ => break,
            }
        }
        return seen.then_some(value);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn pool() -> BufferPool {
        BufferPool::new(4096, 16)
    }

    #[test]
    fn frames_a_headers_only_request() {
        let raw = b"GET /getBucket/ HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let pool = pool();
        let mut msg = Msg::new();
        let framed = read_request(&mut Cursor::new(raw.to_vec()), &pool, &mut msg).expect("frame");
        assert_eq!(framed.total_read, raw.len());
        assert_eq!(framed.header_len, raw.len());
        assert_eq!(framed.content_length, 0);
        assert_eq!(msg.to_vec(), raw);
    }

    #[test]
    fn reads_the_declared_body() {
        let raw = b"PUT /createObject/b/k HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let pool = pool();
        let mut msg = Msg::new();
        let framed = read_request(&mut Cursor::new(raw.to_vec()), &pool, &mut msg).expect("frame");
        assert_eq!(framed.content_length, 11);
        assert_eq!(framed.header_len, raw.len() - 11);
        assert_eq!(&msg.to_vec()[framed.header_len..], b"hello world");
    }

    #[test]
    fn content_length_scan_is_case_insensitive() {
        let head = b"PUT /x HTTP/1.1\r\ncOnTeNt-LeNgTh:  42\r\n\r\n";
        assert_eq!(scan_content_length(head), Some(42));
        assert_eq!(scan_content_length(b"GET / HTTP/1.1\r\n\r\n"), None);
    }

    #[test]
    fn rejects_oversized_bodies() {
        let raw = format!(
            "PUT /x HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_CONTENT_LENGTH + 1
        );
        let pool = pool();
        let mut msg = Msg::new();
        let err = read_request(&mut Cursor::new(raw.into_bytes()), &pool, &mut msg)
            .expect_err("must reject");
        assert!(matches!(err, HttpError::BodyTooLarge(_)));
    }

    #[test]
    fn rejects_unterminated_headers() {
        let raw = b"GET / HTTP/1.1\r\nHost: x".to_vec();
        let pool = pool();
        let mut msg = Msg::new();
        let err = read_request(&mut Cursor::new(raw), &pool, &mut msg).expect_err("must reject");
        assert!(matches!(err, HttpError::Truncated));
    }

    #[test]
    fn empty_connection_is_distinguished() {
        let pool = pool();
        let mut msg = Msg::new();
        let err = read_request(&mut Cursor::new(Vec::new()), &pool, &mut msg).expect_err("eof");
        assert!(matches!(err, HttpError::ConnectionClosed));
    }

    #[test]
    fn oversized_header_section_is_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER + 16));
        let pool = BufferPool::new(65536, 8);
        let mut msg = Msg::new();
        let err = read_request(&mut Cursor::new(raw), &pool, &mut msg).expect_err("too large");
        assert!(matches!(err, HttpError::HeadersTooLarge(_)));
    }
}
