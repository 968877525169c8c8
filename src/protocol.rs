//! wiretap/src/protocol.rs
//! HTTP preamble parsing and serialization utilities.

use crate::types::{ParseKind, ProxyError, Result};
use std::io::{Error, ErrorKind};
use std::str;
use tokio::io::AsyncReadExt;

/// Proxy-form request target, `[scheme://]host[:port][path]`.
///
/// An omitted port defaults to 80 for `http` and 443 for `https`; with any
/// other scheme it stays 0, which callers must treat as invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Uri {
    pub fn parse(s: &str) -> Result<Uri> {
        let fail = || ProxyError::Parse {
            kind: ParseKind::Uri,
            input: s.to_string(),
        };

        let (scheme, rest) = match s.find("://") {
            Some(at) => {
                let scheme = &s[..at];
                if scheme.is_empty()
                    || !scheme.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                {
                    return Err(fail());
                }
                (scheme, &s[at + 3..])
            }
            None => ("", s),
        };

        let host_end = rest.find([':', '/']).unwrap_or(rest.len());
        let host = &rest[..host_end];
        if host.is_empty() {
            return Err(fail());
        }

        let mut tail = &rest[host_end..];
        let mut port = None;
        if let Some(after) = tail.strip_prefix(':') {
            let digits_end = after
                .bytes()
                .position(|b| !b.is_ascii_digit())
                .unwrap_or(after.len());
            // A ':' not followed by digits belongs to the path.
            if digits_end > 0 {
                // Over-long literals truncate into u16 range.
                let value = after[..digits_end]
                    .bytes()
                    .fold(0u32, |acc, b| (acc * 10 + u32::from(b - b'0')) % 65536);
                port = Some(value as u16);
                tail = &after[digits_end..];
            }
        }
        let port = match port {
            Some(port) => port,
            None => match scheme {
                "http" => 80,
                "https" => 443,
                _ => 0,
            },
        };

        Ok(Uri {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: tail.to_string(),
        })
    }
}

/// Parsed HTTP/1.x request preamble. Headers keep their first-seen order and
/// any duplicate names; values are raw bytes, stored verbatim past the
/// `": "` separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEntity {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestEntity {
    /// Parses a full preamble, start line through the terminating empty line.
    pub fn parse(head: &[u8]) -> Result<RequestEntity> {
        let fail = |kind: ParseKind| ProxyError::Parse {
            kind,
            input: String::from_utf8_lossy(head).into_owned(),
        };

        let mut rest = head;
        let line_end = find_crlf(rest).ok_or_else(|| fail(ParseKind::StartLine))?;
        let line = &rest[..line_end];
        rest = &rest[line_end + 2..];

        // The start-line grammar is ASCII-only.
        let line = str::from_utf8(line).map_err(|_| fail(ParseKind::StartLine))?;
        let mut parts = line.splitn(3, ' ');
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("");
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(fail(ParseKind::StartLine));
        }
        if target.is_empty() || !is_http_version(version) {
            return Err(fail(ParseKind::StartLine));
        }

        let mut headers = Vec::new();
        loop {
            let line_end = find_crlf(rest).ok_or_else(|| fail(ParseKind::Header))?;
            let line = &rest[..line_end];
            rest = &rest[line_end + 2..];
            if line.is_empty() {
                break;
            }

            // The first ':' splits the line and must be followed by a space.
            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| fail(ParseKind::Header))?;
            if colon == 0 {
                return Err(fail(ParseKind::Header));
            }
            let value = line[colon + 1..]
                .strip_prefix(b" ")
                .ok_or_else(|| fail(ParseKind::Header))?;
            let name = str::from_utf8(&line[..colon]).map_err(|_| fail(ParseKind::Header))?;
            headers.push((name.to_string(), value.to_vec()));
        }

        Ok(RequestEntity {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Serializes the origin-form rewrite of this request: the target is
    /// reduced to its path (defaulting to `/`), headers go out verbatim.
    pub fn dump(&self) -> Result<Vec<u8>> {
        let uri = Uri::parse(&self.target)?;
        let path = if uri.path.is_empty() { "/" } else { &uri.path };

        let mut out = Vec::with_capacity(64 + self.target.len());
        out.extend_from_slice(format!("{} {} {}\r\n", self.method, path, self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        Ok(out)
    }
}

fn is_http_version(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 8
        && b.starts_with(b"HTTP/")
        && b[5].is_ascii_digit()
        && b[6] == b'.'
        && b[7].is_ascii_digit()
}

/// Reads from the client until the `\r\n\r\n` preamble terminator appears.
///
/// Returns the raw preamble (terminator included) and the residual bytes
/// read past it, which belong to the request body or the first tunneled
/// chunk. The reader never commits before seeing the full terminator, no
/// matter how the bytes are segmented.
pub async fn read_preamble<R>(stream: &mut R, max_len: usize) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncReadExt + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "client closed before preamble end",
            )
            .into());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(at) = find_terminator(&buf) {
            break at + 4;
        }
        if buf.len() > max_len {
            return Err(ProxyError::Parse {
                kind: ParseKind::PreambleTooLarge,
                input: format!("{} bytes", buf.len()),
            });
        }
    };

    let residual = buf.split_off(head_end);
    Ok((buf, residual))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
