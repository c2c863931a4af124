//! Receive and send buffers for a session.

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};

//------------ RecvBuf ------------------------------------------------------

/// A growable buffer that bytes are read into and frames parsed out of.
///
/// Capacity grows by doubling whenever an append would not fit; data is
/// never dropped to make room. Consumed prefixes shift the remainder to
/// the front of the buffer.
#[derive(Debug, Default)]
pub struct RecvBuf {
    inner: BytesMut,
}

/// Read chunk size, also the initial capacity.
const CHUNK: usize = 1024;

impl RecvBuf {
    pub fn new() -> RecvBuf {
        RecvBuf {
            inner: BytesMut::with_capacity(CHUNK),
        }
    }

    /// Grows the buffer until at least `additional` more bytes fit.
    pub fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.inner.len() + additional;
        let mut target = self.inner.capacity().max(CHUNK);
        while target < needed {
            target *= 2;
        }
        if target > self.inner.capacity() {
            self.inner.reserve(target - self.inner.len());
        }
    }

    /// Appends a byte slice.
    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.inner.extend_from_slice(bytes);
    }

    /// Inserts a byte slice in front of the buffered data.
    pub fn prepend(&mut self, bytes: &[u8]) {
        let tail = self.inner.split();
        self.ensure_capacity(bytes.len() + tail.len());
        self.inner.extend_from_slice(bytes);
        self.inner.extend_from_slice(&tail);
    }

    /// Reads once from `src`, appending whatever arrives.
    ///
    /// Returns the number of bytes read; zero means EOF.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; CHUNK];
        let n = src.read(&mut chunk)?;
        if n > 0 {
            self.append(&chunk[..n]);
        }
        Ok(n)
    }

    /// Finds the first occurrence of `delimiter` in the buffered data.
    pub fn find(&self, delimiter: &[u8]) -> Option<usize> {
        let data = self.as_slice();
        if delimiter.is_empty() || data.len() < delimiter.len() {
            return None;
        }
        (0..=data.len() - delimiter.len())
            .find(|&i| &data[i..i + delimiter.len()] == delimiter)
    }

    /// Removes the first `n` bytes.
    pub fn consume_prefix(&mut self, n: usize) {
        let n = n.min(self.inner.len());
        self.inner.advance(n);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}


//------------ SendBuf ------------------------------------------------------

/// The buffer replies are assembled in before being written out.
#[derive(Debug, Default)]
pub struct SendBuf {
    inner: Vec<u8>,
}

impl SendBuf {
    pub fn new() -> SendBuf {
        SendBuf { inner: Vec::new() }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Writes everything buffered to `dst` and clears the buffer.
    pub fn flush_to<W: Write>(&mut self, dst: &mut W) -> io::Result<()> {
        if self.inner.is_empty() {
            return Ok(());
        }
        dst.write_all(&self.inner)?;
        dst.flush()?;
        self.inner.clear();
        Ok(())
    }
}
