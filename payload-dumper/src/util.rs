// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Path, PathBuf},
};

use num_traits::PrimInt;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Display> fmt::Display for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "{} byte", self.0)
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Check if a byte slice is all zeros.
#[cfg(test)]
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

/// Check that `name` is exactly one normal path component. This rejects empty
/// strings, `.`, `..`, and anything containing a path separator.
pub fn is_single_component(name: &str) -> bool {
    !name.is_empty() && Path::new(name).file_name() == Some(OsStr::new(name))
}

/// Join `parent` with a single path component. Fails if `name` would escape
/// `parent` or refer to something other than a direct child.
pub fn path_join_single(parent: &Path, name: impl AsRef<str>) -> io::Result<PathBuf> {
    let name = name.as_ref();

    if !is_single_component(name) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unsafe path component: {name:?}"),
        ));
    }

    Ok(parent.join(name))
}
