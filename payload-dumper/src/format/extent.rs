// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt::{self, Write};

use thiserror::Error;

use crate::protobuf::chromeos_update_engine::Extent;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("Extent {start_block}+{num_blocks} exceeds integer bounds for block size {block_size}")]
    IntegerTooLarge {
        start_block: u64,
        num_blocks: u64,
        block_size: u32,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A byte range within an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// Formats as `<offset>:<length>`, which is what the patch tools expect.
impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.offset, self.length)
    }
}

/// Convert an extent to the byte range `[start_block * block_size, (start_block
/// + num_blocks) * block_size)`.
pub fn extent_range(extent: &Extent, block_size: u32) -> Result<ByteRange> {
    let start_block = extent
        .start_block
        .ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;
    let too_large = || Error::IntegerTooLarge {
        start_block,
        num_blocks,
        block_size,
    };

    let offset = start_block
        .checked_mul(block_size.into())
        .ok_or_else(too_large)?;
    let length = num_blocks
        .checked_mul(block_size.into())
        .ok_or_else(too_large)?;

    // The end must be representable too.
    offset.checked_add(length).ok_or_else(too_large)?;

    Ok(ByteRange { offset, length })
}

/// Convert a list of extents to byte ranges, preserving order.
pub fn extent_ranges(extents: &[Extent], block_size: u32) -> Result<Vec<ByteRange>> {
    extents
        .iter()
        .map(|e| extent_range(e, block_size))
        .collect()
}

/// Total number of bytes covered by a list of extents.
pub fn extents_length(extents: &[Extent], block_size: u32) -> Result<u64> {
    let mut total = 0u64;

    for extent in extents {
        let range = extent_range(extent, block_size)?;

        total = total
            .checked_add(range.length)
            .ok_or_else(|| Error::IntegerTooLarge {
                start_block: extent.start_block.unwrap_or_default(),
                num_blocks: extent.num_blocks.unwrap_or_default(),
                block_size,
            })?;
    }

    Ok(total)
}

/// Format byte ranges as a comma-separated list of `<offset>:<length>` pairs.
pub fn format_ranges(ranges: &[ByteRange]) -> String {
    let mut result = String::new();

    for (i, range) in ranges.iter().enumerate() {
        if i > 0 {
            result.push(',');
        }

        // Writing to a String can't fail.
        let _ = write!(result, "{range}");
    }

    result
}
