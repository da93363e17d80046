//! Line-buffered copy with optional substitution
//!
//! Reads a source in delimiter-terminated chunks, rewrites each chunk with a
//! precompiled regular expression, and writes the result to every destination
//! in order. Streams are never closed here; that belongs to the caller.

use std::borrow::Cow;
use std::io;
use std::net::Ipv4Addr;

use regex::bytes::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::Result;

/// Matches `serverip='a.b.c.d'`, capturing the key
pub const SERVER_IP_PATTERN: &str = r"(serverip=)'[0-9]+\.[0-9]+\.[0-9]+\.[0-9]+'";

/// Newline, the record delimiter of the forward flow
pub const LINE_DELIMITER: u8 = b'\n';

/// A compiled substitution rule
#[derive(Debug, Clone)]
pub struct Rewrite {
    pattern: Regex,
    replacement: Vec<u8>,
}

impl Rewrite {
    /// Compile `pattern`. The replacement may reference capture groups (`${1}`).
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.into().into_bytes(),
        })
    }

    /// Rule replacing the quoted `serverip=` value with `ip`
    pub fn server_ip(ip: Ipv4Addr) -> Result<Self> {
        Self::new(SERVER_IP_PATTERN, format!("${{1}}'{}'", ip))
    }

    /// Apply the rule to one chunk
    pub fn apply<'a>(&self, chunk: &'a [u8]) -> Cow<'a, [u8]> {
        self.pattern.replace_all(chunk, self.replacement.as_slice())
    }
}

/// Copies a source into a set of destinations one record at a time
#[derive(Debug)]
pub struct PatternCopier<'a> {
    delimiter: u8,
    rewrite: Option<&'a Rewrite>,
    written: u64,
}

impl<'a> PatternCopier<'a> {
    pub fn new(delimiter: u8, rewrite: Option<&'a Rewrite>) -> Self {
        Self {
            delimiter,
            rewrite,
            written: 0,
        }
    }

    /// Bytes written to each destination so far, after rewriting
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copy `source` into every destination until end-of-stream.
    ///
    /// A trailing chunk without a delimiter is still forwarded. Any read or
    /// write failure, including a short write, ends the copy with that error.
    pub async fn copy<R, W>(&mut self, source: R, destinations: &mut [W]) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(source);
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            if reader.read_until(self.delimiter, &mut chunk).await? == 0 {
                break;
            }

            let output = match self.rewrite {
                Some(rewrite) => rewrite.apply(&chunk),
                None => Cow::Borrowed(chunk.as_slice()),
            };

            for destination in destinations.iter_mut() {
                destination.write_all(&output).await?;
            }
            self.written += output.len() as u64;
        }

        for destination in destinations.iter_mut() {
            destination.flush().await?;
        }

        Ok(self.written)
    }
}
