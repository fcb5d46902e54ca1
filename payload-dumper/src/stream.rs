// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    digest::{SHA256_LEN, Sha256Hasher},
    util,
};

/// Chunk size for copies between the payload, the images, and patch files.
const COPY_BUF_SIZE: usize = 16384;

/// This is only needed because `dyn Read + Seek` is not a valid construct in
/// Rust yet.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

pub trait WriteZerosExt {
    /// Write exactly `size` zero bytes.
    fn write_zeros(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let n = size.min(util::ZEROS.len() as u64) as usize;
            self.write_all(&util::ZEROS[..n])?;
            size -= n as u64;
        }

        Ok(())
    }
}

pub trait ReadFixedSizeExt {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read exactly `size` bytes. Memory is allocated as data arrives, so a
    /// bogus length field cannot allocate more than the stream contains.
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self.take(size as u64).read_to_end(&mut buf)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(buf)
    }
}

/// Passes writes through to the inner writer while computing the SHA-256
/// digest of everything written.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256Hasher,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256Hasher::new(),
        }
    }

    pub fn finish(self) -> (W, [u8; SHA256_LEN]) {
        (self.inner, self.hasher.finish())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`. Hitting EOF on either
/// side first is an error. `cancel_signal` is checked before every chunk.
pub fn copy_exact(
    mut reader: impl Read,
    mut writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        check_cancel(cancel_signal)?;

        let n = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..n])?;
        writer.write_all(&buf[..n])?;

        remaining -= n as u64;
    }

    Ok(())
}

/// Copy from `reader` to `writer` until `reader` reaches EOF, using a buffer
/// of `buf_size` bytes. Returns the number of bytes copied.
pub fn copy_buffered(
    mut reader: impl Read,
    mut writer: impl Write,
    buf_size: usize,
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buf_size];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}
