// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Write};

use num_traits::PrimInt;

use crate::stream::WriteZerosExt;

/// Calculate the amount of padding that needs to be added to align the
/// specified offset to a block boundary.
pub fn calc<N: PrimInt>(offset: N, block_size: N) -> N {
    let r = offset % block_size;
    if r == N::zero() {
        N::zero()
    } else {
        block_size - r
    }
}

/// Write enough zeros to align `written` bytes to the next multiple of the
/// block size. Returns the number of zeros written.
pub fn write_zeros(mut writer: impl Write, written: u64, block_size: u64) -> io::Result<u64> {
    let padding = calc(written, block_size);

    writer.write_zeros(padding)?;

    Ok(padding)
}
