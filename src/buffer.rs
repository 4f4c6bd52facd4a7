/*!
An in-memory buffer over an append-only sink.
*/

use std::io::{self, Write};

use crate::error::{self, Latched};

/**
The default capacity of a [`BufferWriter`] in bytes.
*/
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/**
Batch small writes into a fixed-capacity buffer before handing them to a sink.

A [`BufferWriter`] isn't synchronized. [`crate::FileBuffer`] wraps one in a lock for use across threads.

# Errors

The first error returned by the sink is latched. Every later [`BufferWriter::flush`], and every [`BufferWriter::write`] that doesn't fit in the remaining capacity, returns that same error without touching the sink again. There's no recovery; the writer needs to be replaced.

Writes that still fit into the remaining capacity of a poisoned writer succeed locally, but their bytes are never delivered.
*/
pub struct BufferWriter<W> {
    buf: Box<[u8]>,
    n: usize,
    err: Option<Latched>,
    sink: W,
}

impl<W: Write> BufferWriter<W> {
    /**
    Create a writer over `sink` with [`DEFAULT_BUFFER_SIZE`] capacity.
    */
    pub fn new(sink: W) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, sink)
    }

    /**
    Create a writer over `sink` that holds up to `capacity` bytes.

    A `capacity` of `0` uses [`DEFAULT_BUFFER_SIZE`].
    */
    pub fn with_capacity(capacity: usize, sink: W) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            capacity
        };

        BufferWriter {
            buf: vec![0; capacity].into_boxed_slice(),
            n: 0,
            err: None,
            sink,
        }
    }

    /**
    The number of bytes that can be written before the buffer overflows.
    */
    pub fn available(&self) -> usize {
        self.buf.len() - self.n
    }

    /**
    The number of bytes currently held in the buffer.
    */
    pub fn buffered(&self) -> usize {
        self.n
    }

    /**
    The total capacity of the buffer.
    */
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /**
    Get a reference to the underlying sink.
    */
    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /**
    Get a mutable reference to the underlying sink.

    Writing to the sink directly bypasses any buffered bytes.
    */
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    /**
    Discard the buffer, returning the underlying sink.

    Buffered bytes that haven't been flushed are lost.
    */
    pub fn into_inner(self) -> W {
        self.sink
    }

    /**
    Write `buf` into the buffer, flushing to the sink if it overflows.

    If `buf` doesn't fit and nothing is buffered then it's written to the sink directly. Otherwise it's split into chunks that fill the buffer, flushing after each one.

    If a flush fails partway through, the bytes accepted so far are returned and the error surfaces on the next call. If nothing was accepted the error is returned.
    */
    pub fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.available() && self.err.is_none() {
            if self.buffered() == 0 {
                // Large write into an empty buffer; skip the copy
                return match self.sink.write(buf) {
                    Ok(n) => Ok(n),
                    Err(err) => {
                        let latched = Latched::new(err);
                        let err = latched.to_io_error();

                        self.err = Some(latched);

                        Err(err)
                    }
                };
            }

            let mut written = 0;
            while !buf.is_empty() {
                let n = self.copy_in(buf);
                written += n;
                buf = &buf[n..];

                if let Err(err) = self.flush() {
                    return if written > 0 { Ok(written) } else { Err(err) };
                }
            }

            return Ok(written);
        }

        // NOTE: A latched error is only rechecked when the write overflows
        // Small writes into a poisoned buffer are accepted and later discarded
        Ok(self.copy_in(buf))
    }

    /**
    Write any buffered bytes to the sink.

    A write that's accepted by the sink, but shorter than the buffered bytes, is treated as an error. The unwritten tail is kept at the front of the buffer.
    */
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(ref err) = self.err {
            return Err(err.to_io_error());
        }

        if self.n == 0 {
            return Ok(());
        }

        let (written, err) = match self.sink.write(&self.buf[..self.n]) {
            Ok(written) if written < self.n => (written, error::short_write()),
            Ok(_) => {
                self.n = 0;
                return Ok(());
            }
            Err(err) => (0, err),
        };

        if written > 0 {
            self.buf.copy_within(written..self.n, 0);
        }
        self.n -= written;

        let latched = Latched::new(err);
        let err = latched.to_io_error();

        self.err = Some(latched);

        Err(err)
    }

    fn copy_in(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.available());

        self.buf[self.n..self.n + n].copy_from_slice(&buf[..n]);
        self.n += n;

        n
    }
}

impl<W: Write> Write for BufferWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BufferWriter::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        BufferWriter::flush(self)
    }
}
