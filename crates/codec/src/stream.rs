//! A byte stream with savepoint semantics.
//!
//! Stream parsers in lnsd speculatively read a frame out of a receive
//! buffer. When the frame turns out to be incomplete the buffer must look
//! exactly as it did before the attempt, because the missing bytes arrive in
//! a later read. [`Transaction`] provides that guarantee: it hands out a
//! private copy of the stream, and only [`Transaction::commit`] makes the
//! private state visible to the parent.

/// A growable byte buffer with a read/write position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteStream {
    buffer: Vec<u8>,
    position: usize,
}

impl From<Vec<u8>> for ByteStream {
    fn from(buffer: Vec<u8>) -> Self {
        Self { buffer, position: 0 }
    }
}

impl From<&[u8]> for ByteStream {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes at the end of the buffer without moving the position.
    ///
    /// This is how socket reads land in a per-peer buffer while a parser may
    /// still be partway through it.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes at the current position, overwriting existing bytes and
    /// extending the buffer past its end. The position advances by the
    /// number of bytes written.
    pub fn write(&mut self, bytes: &[u8]) {
        let overlap = (self.buffer.len() - self.position).min(bytes.len());
        self.buffer[self.position..self.position + overlap].copy_from_slice(&bytes[..overlap]);
        self.buffer.extend_from_slice(&bytes[overlap..]);
        self.position += bytes.len();
    }

    /// Reads up to `count` bytes from the current position. A short result
    /// means the stream ended.
    pub fn read(&mut self, count: usize) -> Vec<u8> {
        let end = (self.position + count).min(self.buffer.len());
        let bytes = self.buffer[self.position..end].to_vec();
        self.position = end;
        bytes
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.buffer.len());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes left between the position and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Drops everything before the current position and resets the position
    /// to zero, so a long-lived receive buffer does not grow without bound.
    pub fn compact(&mut self) {
        self.buffer.drain(..self.position);
        self.position = 0;
    }

    /// Opens a transaction over this stream.
    ///
    /// # Test
    ///
    /// ```
    /// use lnsd_codec::stream::ByteStream;
    ///
    /// let mut stream = ByteStream::from(&b"exactly ten"[..]);
    ///
    /// let mut txn = stream.begin();
    /// assert_eq!(txn.stream().read(7), b"exactly");
    /// txn.abort();
    /// assert_eq!(stream.position(), 0);
    ///
    /// let mut txn = stream.begin();
    /// assert_eq!(txn.stream().read(7), b"exactly");
    /// txn.commit();
    /// assert_eq!(stream.position(), 7);
    /// ```
    pub fn begin(&mut self) -> Transaction<'_> {
        let stream = self.clone();
        Transaction { parent: self, stream }
    }
}

/// A savepoint over a [`ByteStream`].
///
/// Dropping a transaction without committing behaves like [`Transaction::abort`].
pub struct Transaction<'a> {
    parent: &'a mut ByteStream,
    stream: ByteStream,
}

impl Transaction<'_> {
    /// The private stream the transaction reads and writes.
    pub fn stream(&mut self) -> &mut ByteStream {
        &mut self.stream
    }

    /// Applies the transaction to the parent. When the contents did not
    /// change, only the position moves.
    pub fn commit(self) {
        if self.parent.buffer != self.stream.buffer {
            self.parent.buffer = self.stream.buffer;
        }

        self.parent.position = self.stream.position;
    }

    /// Discards the transaction. This is what dropping does as well; calling
    /// it states the intent.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::ByteStream;

    #[test]
    fn aborted_transaction_leaves_parent_untouched() {
        let mut stream = ByteStream::from(&b"cool story, bro"[..]);
        stream.read(4);

        let before = stream.clone();
        let mut txn = stream.begin();
        txn.stream().write(b"blah blah");
        txn.stream().read(2);
        txn.abort();

        assert_eq!(stream, before);
    }

    #[test]
    fn dropped_transaction_aborts() {
        let mut stream = ByteStream::from(&b"state"[..]);

        {
            let mut txn = stream.begin();
            txn.stream().read(5);
        }

        assert_eq!(stream.position(), 0);
    }

    #[test]
    fn committed_write_replaces_parent_contents() {
        let mut stream = ByteStream::from(&b"cool story, bro"[..]);

        let mut txn = stream.begin();
        txn.stream().write(b"what");
        let position = txn.stream().position();
        txn.commit();

        assert_eq!(stream.as_bytes(), b"what story, bro");
        assert_eq!(stream.position(), position);
    }

    #[test]
    fn commit_without_change_only_moves_position() {
        let mut stream = ByteStream::from(&b"read only"[..]);

        let mut txn = stream.begin();
        txn.stream().read(4);
        txn.commit();

        assert_eq!(stream.as_bytes(), b"read only");
        assert_eq!(stream.position(), 4);
    }

    #[test]
    fn write_overlaps_then_extends() {
        let mut stream = ByteStream::from(&b"abcdef"[..]);
        stream.set_position(4);
        stream.write(b"XYZW");

        assert_eq!(stream.as_bytes(), b"abcdXYZW");
        assert_eq!(stream.position(), 8);
    }

    #[test]
    fn short_read_and_compact() {
        let mut stream = ByteStream::from(&b"abc"[..]);
        assert_eq!(stream.read(10), b"abc");
        assert_eq!(stream.remaining(), 0);

        stream.push(b"def");
        assert_eq!(stream.remaining(), 3);

        stream.compact();
        assert_eq!(stream.as_bytes(), b"def");
        assert_eq!(stream.position(), 0);
    }
}
