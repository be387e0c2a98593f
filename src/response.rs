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

//! Response composition into a message view.
//!
//! Every response goes out through [`Msg::copy_in`], so the write path stays
//! on the pool end to end. All writers return false when the pool is
//! exhausted mid-compose; the connection handler downgrades to a minimal 503
//! or closes.

use serde_json::json;

use crate::buffer::{BufferPool, Msg};

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Compose status line, `Content-Length`, optional `Content-Type`, blank
/// line and body.
pub fn write_response(
    out: &mut Msg,
    pool: &BufferPool,
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
) -> bool {
    out.clear();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
        status,
        status_text(status),
        body.len()
    );
    if let Some(ct) = content_type {
        head.push_str("Content-Type: ");
        head.push_str(ct);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    out.copy_in(pool, head.as_bytes()) && out.copy_in(pool, body)
}

/// Success body: `{"code":1, ...}`.
pub fn write_json(out: &mut Msg, pool: &BufferPool, status: u16, value: &serde_json::Value) -> bool {
    let body = value.to_string();
    write_response(out, pool, status, Some("application/json"), body.as_bytes())
}

/// Error body: `{"code":0,"Code":"<symbol>","Message":"<text>"}`.
pub fn write_error(out: &mut Msg, pool: &BufferPool, status: u16, code: &str, message: &str) -> bool {
    let body = json!({ "code": 0, "Code": code, "Message": message });
    write_json(out, pool, status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_status_headers_and_body() {
        let pool = BufferPool::new(4096, 8);
        let mut out = Msg::new();
        assert!(write_response(&mut out, &pool, 200, Some("application/octet-stream"), b"abc"));
        let text = String::from_utf8(out.to_vec()).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.contains("Content-Type: application/octet-stream\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn error_bodies_carry_code_zero() {
        let pool = BufferPool::new(4096, 8);
        let mut out = Msg::new();
        assert!(write_error(&mut out, &pool, 404, "NoSuchKey", "Object not found"));
        let text = String::from_utf8(out.to_vec()).expect("utf8");
        let body = text.split("\r\n\r\n").nth(1).expect("body");
        let v: serde_json::Value = serde_json::from_str(body).expect("json");
        assert_eq!(v["code"], 0);
        assert_eq!(v["Code"], "NoSuchKey");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn pool_exhaustion_reports_false() {
        let pool = BufferPool::new(4096, 1);
        let big = vec![b'x'; 2 * 4096];
        let mut out = Msg::new();
        assert!(!write_response(&mut out, &pool, 200, None, &big));
    }
}
