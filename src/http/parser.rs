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

//! Request-line and header parsing for a framed request message.

use percent_encoding::percent_decode_str;

use crate::buffer::Msg;

use super::HttpError;

/// A parsed request. Only the headers the service interprets are retained;
/// everything else is ignored.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    /// Normalized path: collapsed slashes, no `.` or `..` segments.
    pub path: String,
    /// Raw query string (the part after `?`), not decoded at this layer.
    pub query: String,
    pub host: String,
    pub content_type: String,
    pub content_md5: String,
    /// -1 when the header was absent.
    pub content_length: i64,
}

impl Request {
    /// Look up a query parameter. Key and value are percent-decoded; `+` is
    /// left alone because Base64 signatures carry it literally.
    pub fn query_param(&self, key: &str) -> Option<String> {
        for pair in self.query.split('&') {
            let (k, v) = match pair.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            if percent_decode_str(k).decode_utf8_lossy() == key {
                return Some(percent_decode_str(v).decode_utf8_lossy().into_owned());
            }
        }
        None
    }
}

/// Collapse a request path: runs of `/` coalesce, `.` segments drop, `..`
/// pops the previous segment without ever escaping the root. The result
/// always begins with `/` and never contains `..`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if let Some(pos) = out.rfind('/') {
                    out.truncate(pos);
                }
            }
            _ => {
                out.push('/');
                out.push_str(seg);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parse a completed request message: request line, then headers up to the
/// blank line. The body, if any, stays untouched in the message.
pub fn parse_request(msg: &Msg) -> Result<Request, HttpError> {
    let bytes = msg.to_vec();
    if bytes.is_empty() {
        return Err(HttpError::Malformed("empty request"));
    }

    let mut lines = CrlfLines { rest: &bytes };
    let first = lines
        .next()
        .ok_or(HttpError::Malformed("missing request line"))?;
    let first = std::str::from_utf8(first).map_err(|_| HttpError::Malformed("bad request line"))?;

    let mut parts = first.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or(HttpError::Malformed("missing method"))?;
    let uri = parts.next().ok_or(HttpError::Malformed("missing uri"))?;
    if parts.next().is_none() {
        return Err(HttpError::Malformed("missing http version"));
    }

    let mut req = Request {
        method: method.to_string(),
        content_length: -1,
        ..Request::default()
    };
    match uri.split_once('?') {
        Some((path, query)) => {
            req.path = normalize_path(path);
            req.query = query.to_string();
        }
        None => req.path = normalize_path(uri),
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let key = &line[..colon];
        let value = String::from_utf8_lossy(&line[colon + 1..])
            .trim_matches([' ', '\t'])
            .to_string();
        if key.eq_ignore_ascii_case(b"Host") {
            req.host = value;
        } else if key.eq_ignore_ascii_case(b"Content-Type") {
            req.content_type = value;
        } else if key.eq_ignore_ascii_case(b"Content-MD5") {
            req.content_md5 = value;
        } else if key.eq_ignore_ascii_case(b"Content-Length") {
            req.content_length = value.bytes().take_while(u8::is_ascii_digit).fold(0i64, |acc, b| {
                acc.saturating_mul(10).saturating_add((b - b'0') as i64)
            });
        }
    }

    Ok(req)
}

/// Iterator over `\r\n`-terminated lines; stops at the first line without a
/// terminator (the body boundary was located by the framer already).
struct CrlfLines<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let pos = self.rest.windows(2).position(|w| w == b"\r\n")?;
        let line = &self.rest[..pos];
        self.rest = &self.rest[pos + 2..];
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn msg_from(raw: &[u8]) -> (BufferPool, Msg) {
        let pool = BufferPool::new(4096, 8);
        let mut msg = Msg::new();
        assert!(msg.copy_in(&pool, raw));
        (pool, msg)
    }

    #[test]
    fn parses_request_line_headers_and_query() {
        let raw = b"PUT /createBucket/b?AWSAccessKeyId=AK&Expires=99 HTTP/1.1\r\n\
                    Host: example.com\r\n\
                    content-type: text/plain\r\n\
                    CONTENT-MD5: abc==\r\n\
                    Content-Length: 5\r\n\
                    X-Ignored: whatever\r\n\r\nhello";
        let (_pool, msg) = msg_from(raw);
        let req = parse_request(&msg).expect("parse");
        assert_eq!(req.method, "PUT");
        assert_eq!(req.path, "/createBucket/b");
        assert_eq!(req.query, "AWSAccessKeyId=AK&Expires=99");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.content_type, "text/plain");
        assert_eq!(req.content_md5, "abc==");
        assert_eq!(req.content_length, 5);
        assert_eq!(req.query_param("AWSAccessKeyId").as_deref(), Some("AK"));
        assert_eq!(req.query_param("Expires").as_deref(), Some("99"));
        assert_eq!(req.query_param("Missing"), None);
    }

    #[test]
    fn rejects_garbage() {
        let (_pool, msg) = msg_from(b"NOT-HTTP\r\n\r\n");
        assert!(parse_request(&msg).is_err());
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("//a///b"), "/a/b");
        assert_eq!(normalize_path("/a/./b"), "/a/b");
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/../../x"), "/x");
        assert_eq!(normalize_path("/a/b/../../../.."), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("relative/path"), "/relative/path");
    }

    #[test]
    fn query_params_decode_percent_but_keep_plus() {
        let req = Request {
            query: "Signature=ab%2Fcd%3D&note=a+b&enc%6Bey=v".to_string(),
            ..Request::default()
        };
        assert_eq!(req.query_param("Signature").as_deref(), Some("ab/cd="));
        assert_eq!(req.query_param("note").as_deref(), Some("a+b"));
        assert_eq!(req.query_param("enckey").as_deref(), Some("v"));
    }

    #[test]
    fn absent_content_length_is_negative_one() {
        let (_pool, msg) = msg_from(b"GET / HTTP/1.1\r\n\r\n");
        let req = parse_request(&msg).expect("parse");
        assert_eq!(req.content_length, -1);
    }
}
