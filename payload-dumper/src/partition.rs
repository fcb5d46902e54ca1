// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    apply::{self, OperationContext, SourceImage},
    digest::{self, DigestKind, SHA256_LEN},
    format::payload::PayloadHeader,
    patcher::Patcher,
    protobuf::chromeos_update_engine::{PartitionInfo, PartitionUpdate},
    stream::{self, HashingWriter},
    util,
};

/// Buffer size for hashing the finished image.
const VERIFY_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create output image: {0:?}")]
    Create(PathBuf, #[source] io::Error),
    #[error("Operation #{index} ({op_type}) failed")]
    Operation {
        index: usize,
        op_type: String,
        #[source]
        source: apply::Error,
    },
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Expected image size {expected}, but have {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Integrity check failed")]
    Digest(#[from] digest::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    WritingOperations,
    Verifying,
    Done,
    Failed,
}

fn base64_hash(hash: Option<&[u8]>) -> String {
    hash.map_or_else(|| "<none>".to_owned(), |h| STANDARD.encode(h))
}

fn describe_image(info: Option<&PartitionInfo>) -> String {
    let size = info
        .and_then(|i| i.size)
        .map_or_else(|| "<unknown>".to_owned(), |s| s.to_string());
    let hash = base64_hash(info.and_then(|i| i.hash.as_deref()));

    format!("{size} bytes with sha256 {hash}")
}

/// Rebuilds a single partition image from its operation list.
///
/// The output file is deleted if any operation fails. If the final image does
/// not match the expected digest, the file is kept for inspection, but the
/// reconstruction still fails.
pub struct Reconstructor<'a> {
    header: &'a PayloadHeader,
    partition: &'a PartitionUpdate,
    output: PathBuf,
    source: SourceImage,
    patcher: &'a dyn Patcher,
    verify: bool,
    state: State,
}

impl fmt::Debug for Reconstructor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconstructor")
            .field("name", &self.name())
            .field("output", &self.output)
            .field("source", &self.source)
            .field("verify", &self.verify)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'a> Reconstructor<'a> {
    /// The new image is written to `<out_dir>/<name>.img`. For delta payloads,
    /// the old image is read from `<old_dir>/<name>.img`.
    pub fn new(
        header: &'a PayloadHeader,
        partition: &'a PartitionUpdate,
        old_dir: &Path,
        out_dir: &Path,
        patcher: &'a dyn Patcher,
        verify: bool,
    ) -> Result<Self> {
        let filename = format!("{}.img", partition.partition_name);

        Ok(Self {
            header,
            partition,
            output: util::path_join_single(out_dir, &filename)?,
            source: SourceImage::new(util::path_join_single(old_dir, &filename)?),
            patcher,
            verify,
            state: State::Created,
        })
    }

    pub fn name(&self) -> &str {
        &self.partition.partition_name
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    fn transition(&mut self, state: State) {
        debug!("{}: {:?} -> {:?}", self.name(), self.state, state);
        self.state = state;
    }

    /// Run every operation in order and optionally verify the result. Returns
    /// the digest of the image if it was verified.
    pub fn run(
        &mut self,
        mut payload: impl Read + Seek,
        cancel_signal: &AtomicBool,
    ) -> Result<Option<[u8; SHA256_LEN]>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.output)
        {
            Ok(f) => f,
            Err(e) => {
                self.transition(State::Failed);
                return Err(Error::Create(self.output.clone(), e));
            }
        };

        self.transition(State::WritingOperations);
        debug!(
            "{}: expecting {}",
            self.name(),
            describe_image(self.partition.new_partition_info.as_ref()),
        );

        if let Err(e) = self.write_operations(&mut payload, file, cancel_signal) {
            self.transition(State::Failed);

            if let Err(remove_err) = fs::remove_file(&self.output) {
                warn!("Failed to remove {:?}: {remove_err}", self.output);
            }

            return Err(e);
        }

        let digest = if self.verify {
            self.transition(State::Verifying);

            match self.verify_image(cancel_signal) {
                Ok(d) => Some(d),
                Err(e) => {
                    self.transition(State::Failed);
                    warn!("{}: keeping unverified image {:?}", self.name(), self.output);
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.transition(State::Done);

        Ok(digest)
    }

    fn write_operations(
        &self,
        payload: &mut (impl Read + Seek),
        mut file: File,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let ctx = OperationContext {
            block_size: self.header.block_size(),
            new_image: &self.output,
            source: &self.source,
            patcher: self.patcher,
            cancel_signal,
        };

        for (index, op) in self.partition.operations.iter().enumerate() {
            trace!(
                "{}: operation #{index}: {}, data_offset={:?}, data_length={:?}, data_sha256={}, src_sha256={}",
                self.name(),
                op.type_name(),
                op.data_offset,
                op.data_length,
                base64_hash(op.data_sha256_hash.as_deref()),
                base64_hash(op.src_sha256_hash.as_deref()),
            );

            let offset = self
                .header
                .blob_offset
                .checked_add(op.data_offset.unwrap_or(0))
                .ok_or(Error::IntegerTooLarge("data_offset"))?;
            payload.seek(SeekFrom::Start(offset))?;

            apply::apply_operation(&mut *payload, &mut file, op, &ctx).map_err(|source| {
                Error::Operation {
                    index,
                    op_type: op.type_name(),
                    source,
                }
            })?;
        }

        Ok(())
    }

    /// Hash the first `size` bytes of the output and check that the file is
    /// exactly `size` bytes long.
    fn verify_image(&self, cancel_signal: &AtomicBool) -> Result<[u8; SHA256_LEN]> {
        let info = self.partition.new_partition_info.as_ref();
        let size = info
            .and_then(|i| i.size)
            .ok_or(Error::MissingField("new_partition_info.size"))?;
        let expected = info.and_then(|i| i.hash.as_deref());

        let file = File::open(&self.output)?;
        let actual_size = file.metadata()?.len();

        let mut writer = HashingWriter::new(io::sink());
        stream::copy_buffered(file.take(size), &mut writer, VERIFY_BUF_SIZE, cancel_signal)?;

        let (_, actual) = writer.finish();

        debug!("{}: sha256 {}", self.name(), STANDARD.encode(actual));

        digest::verify_digest(DigestKind::PartitionImage, &actual, expected)?;

        if actual_size != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: actual_size,
            });
        }

        Ok(actual)
    }
}
