//! Whole-file read/write primitives consumed by the request handler.
//!
//! This is the seam in front of the kernel I/O backend: callers hand over a
//! path and a buffer and get back a byte count. The implementation here is
//! the synchronous std one; a ring-based backend slots in behind the same
//! two functions without touching the handler.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Read up to `buf.len()` bytes from the start of the file. Returns the
/// count actually read; callers that know the expected size treat a short
/// count as failure.
pub fn read_file(path: &Path, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Create (or truncate) the file and write `data` in full.
pub fn write_file(path: &Path, data: &[u8]) -> std::io::Result<usize> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_exact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blob");
        assert_eq!(write_file(&path, b"hello world").expect("write"), 11);

        let mut buf = vec![0u8; 11];
        assert_eq!(read_file(&path, &mut buf).expect("read"), 11);
        assert_eq!(&buf, b"hello world");

        // A short buffer reads a prefix; an oversized one reports the size.
        let mut short = vec![0u8; 5];
        assert_eq!(read_file(&path, &mut short).expect("read"), 5);
        let mut long = vec![0u8; 64];
        assert_eq!(read_file(&path, &mut long).expect("read"), 11);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut buf = [0u8; 4];
        assert!(read_file(&dir.path().join("nope"), &mut buf).is_err());
    }
}
