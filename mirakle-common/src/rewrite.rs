//! Live rewriting of remote paths in build output.
//!
//! The remote build prints paths under `<remoteFolder>/<project>`. IDEs and
//! other tools parse those paths, so every `/…/<remoteDir>` prefix is replaced
//! by the local project root while the output is streamed.
//!
//! [`PathRewriter`] is a byte-level matcher: bytes that cannot be part of a
//! match are released immediately, and only the tail starting at the first
//! `/` after the last line break is held back (bounded by
//! [`MAX_WINDOW`]) so that matches split across writes are still found.

use regex::bytes::Regex;
use std::io::{self, Write};

/// Upper bound on the bytes held back while waiting for a match to complete.
pub const MAX_WINDOW: usize = 4096;

/// Streaming remote-to-local path substitution.
#[derive(Debug)]
pub struct PathRewriter {
    pattern: Regex,
    local_dir: Vec<u8>,
    pending: Vec<u8>,
}

impl PathRewriter {
    /// Create a rewriter replacing `/…/<remote_dir>` by `local_dir`. An
    /// absolute `remote_dir` only matches itself.
    pub fn new(remote_dir: &str, local_dir: &str) -> Result<Self, regex::Error> {
        let pattern = if remote_dir.starts_with('/') {
            regex::escape(remote_dir)
        } else {
            format!(r"/(?-u:[^\r\n])*?/{}", regex::escape(remote_dir))
        };
        Ok(Self {
            pattern: Regex::new(&pattern)?,
            local_dir: local_dir.as_bytes().to_vec(),
            pending: Vec::new(),
        })
    }

    /// Feed bytes in, get the bytes that are safe to emit.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(data);

        let mut out = Vec::with_capacity(self.pending.len());
        let mut pos = 0;
        while let Some(m) = self.pattern.find_at(&self.pending, pos) {
            out.extend_from_slice(&self.pending[pos..m.start()]);
            out.extend_from_slice(&self.local_dir);
            pos = m.end();
        }

        let hold = self.hold_point(pos);
        out.extend_from_slice(&self.pending[pos..hold]);
        self.pending.drain(..hold);
        out
    }

    /// Release everything still held back.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Index from which bytes must be kept because a later write could
    /// complete a match starting there.
    fn hold_point(&self, from: usize) -> usize {
        let tail = &self.pending[from..];
        let line_start = tail
            .iter()
            .rposition(|b| *b == b'\n' || *b == b'\r')
            .map_or(0, |i| i + 1);
        let window_start = tail.len().saturating_sub(MAX_WINDOW);
        let search_from = line_start.max(window_start);

        match tail[search_from..].iter().position(|b| *b == b'/') {
            Some(offset) => from + search_from + offset,
            None => self.pending.len(),
        }
    }
}

/// A [`Write`] adapter that rewrites remote paths before forwarding.
///
/// Held-back bytes are forwarded by [`RewritingWriter::finish`] or, best
/// effort, when the writer is dropped.
pub struct RewritingWriter<W: Write> {
    inner: Option<W>,
    rewriter: PathRewriter,
}

impl<W: Write> RewritingWriter<W> {
    pub fn new(inner: W, remote_dir: &str, local_dir: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            inner: Some(inner),
            rewriter: PathRewriter::new(remote_dir, local_dir)?,
        })
    }

    /// Forward the held-back tail and return the wrapped sink.
    pub fn finish(mut self) -> io::Result<W> {
        let rest = self.rewriter.finish();
        let mut inner = self
            .inner
            .take()
            .ok_or_else(|| io::Error::other("rewriting writer already finished"))?;
        inner.write_all(&rest)?;
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for RewritingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let out = self.rewriter.push(buf);
        match self.inner.as_mut() {
            Some(inner) => inner.write_all(&out)?,
            None => return Err(io::Error::other("rewriting writer already finished")),
        }
        Ok(buf.len())
    }

    /// Flushes the wrapped sink. Bytes held back for an incomplete match stay
    /// buffered until more data arrives or the writer is finished.
    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for RewritingWriter<W> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            let rest = self.rewriter.finish();
            let _ = inner.write_all(&rest);
            let _ = inner.flush();
        }
    }
}
