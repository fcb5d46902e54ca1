// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! SHA-256 checks for untrusted data. Every byte read from the payload or from
//! a source image goes through [`verify_digest`] before it is used.

use std::fmt;

use ring::digest::{Context, SHA256};
use thiserror::Error;

pub const SHA256_LEN: usize = 32;

/// What a digest was computed over. Only used for error reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestKind {
    /// Raw operation data from the payload blob section.
    PayloadData,
    /// Concatenated source extents.
    SourceData,
    /// Fully reconstructed partition image.
    PartitionImage,
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadData => f.write_str("payload data"),
            Self::SourceData => f.write_str("source data"),
            Self::PartitionImage => f.write_str("partition image"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Expected {kind} sha256 {}, but have {}", .expected.as_deref().unwrap_or("<missing>"), .actual)]
    Mismatch {
        kind: DigestKind,
        expected: Option<String>,
        actual: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Compute the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; SHA256_LEN] {
    let digest = ring::digest::digest(&SHA256, data);
    let mut result = [0u8; SHA256_LEN];
    result.copy_from_slice(digest.as_ref());
    result
}

/// Incremental SHA-256 hasher for data that is read in chunks.
#[derive(Clone)]
pub struct Sha256Hasher(Context);

impl Sha256Hasher {
    pub fn new() -> Self {
        Self(Context::new(&SHA256))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> [u8; SHA256_LEN] {
        let digest = self.0.finish();
        let mut result = [0u8; SHA256_LEN];
        result.copy_from_slice(digest.as_ref());
        result
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `actual` matches `expected`. A missing expected digest is never
/// a match.
pub fn verify_digest(kind: DigestKind, actual: &[u8], expected: Option<&[u8]>) -> Result<()> {
    if expected == Some(actual) {
        return Ok(());
    }

    Err(Error::Mismatch {
        kind,
        expected: expected.map(hex::encode),
        actual: hex::encode(actual),
    })
}
