// SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashSet,
    io::{self, Read},
};

use num_traits::ToPrimitive;
use prost::Message;
use thiserror::Error;

use crate::{
    format::extent,
    protobuf::chromeos_update_engine::{DeltaArchiveManifest, PartitionUpdate, Signatures},
    stream::{FromReader, ReadFixedSizeExt},
    util,
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";
pub const PAYLOAD_VERSION: u64 = 2;
pub const PAYLOAD_HEADER_SIZE: usize = PAYLOAD_MAGIC.len() + 8 + 8 + 4;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),
    #[error("Partition has an empty name")]
    EmptyPartitionName,
    #[error("Unsafe partition name: {0:?}")]
    UnsafePartitionName(String),
    #[error("Duplicate partition: {0:?}")]
    DuplicatePartition(String),
    #[error("Invalid extent in partition {partition:?}, operation #{index}")]
    InvalidExtent {
        partition: String,
        index: usize,
        #[source]
        source: extent::Error,
    },
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Failed to decode protobuf message")]
    ProtobufDecode(#[from] prost::DecodeError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The parsed envelope of a `payload.bin` file.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub version: u64,
    pub manifest: DeltaArchiveManifest,
    /// Raw metadata signature blob. This is never cryptographically verified.
    pub metadata_signature: Vec<u8>,
    /// Offset of the blob section. Every [`InstallOperation::data_offset`] is
    /// relative to this.
    ///
    /// [`InstallOperation::data_offset`]: crate::protobuf::chromeos_update_engine::InstallOperation::data_offset
    pub blob_offset: u64,
}

impl PayloadHeader {
    pub fn block_size(&self) -> u32 {
        self.manifest.block_size()
    }

    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.old_partition_info.is_none())
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
        self.manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
    }

    /// Decode the metadata signature blob. This only checks that the blob is a
    /// well-formed [`Signatures`] message.
    pub fn metadata_signatures(&self) -> Result<Signatures> {
        Ok(Signatures::decode(self.metadata_signature.as_slice())?)
    }

    /// Structurally validate the manifest. This checks everything that can be
    /// checked without reading the blob section so that an unusable payload
    /// is rejected before any partition is touched.
    pub fn validate(&self) -> Result<()> {
        let block_size = self.block_size();
        if block_size == 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        let mut seen = HashSet::new();

        for partition in &self.manifest.partitions {
            let name = &partition.partition_name;

            if name.is_empty() {
                return Err(Error::EmptyPartitionName);
            } else if !util::is_single_component(name) {
                return Err(Error::UnsafePartitionName(name.clone()));
            } else if !seen.insert(name.as_str()) {
                return Err(Error::DuplicatePartition(name.clone()));
            }

            for (index, op) in partition.operations.iter().enumerate() {
                let invalid_extent = |source| Error::InvalidExtent {
                    partition: name.clone(),
                    index,
                    source,
                };

                extent::extents_length(&op.src_extents, block_size).map_err(invalid_extent)?;
                extent::extents_length(&op.dst_extents, block_size).map_err(invalid_extent)?;

                if let (Some(offset), Some(length)) = (op.data_offset, op.data_length) {
                    offset
                        .checked_add(length)
                        .and_then(|n| n.checked_add(self.blob_offset))
                        .ok_or(Error::IntegerTooLarge("data_offset"))?;
                }
            }
        }

        Ok(())
    }
}

impl<R: Read> FromReader<R> for PayloadHeader {
    type Error = Error;

    /// Parse the header from an OTA payload file. After this function returns,
    /// the file position is set to the beginning of the blob section.
    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<4>()?;
        if magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(magic));
        }

        let version = u64::from_be_bytes(reader.read_array_exact()?);
        if version != PAYLOAD_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let manifest_size = u64::from_be_bytes(reader.read_array_exact()?);
        let metadata_signature_size = u32::from_be_bytes(reader.read_array_exact()?);

        // Data offsets in the manifest are relative to the end of the header.
        let blob_offset = manifest_size
            .checked_add(PAYLOAD_HEADER_SIZE as u64 + u64::from(metadata_signature_size))
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;

        let manifest_size = manifest_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("manifest_size"))?;
        let metadata_signature_size = metadata_signature_size
            .to_usize()
            .ok_or(Error::IntegerTooLarge("metadata_signature_size"))?;

        let manifest_raw = reader.read_vec_exact(manifest_size)?;
        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())?;

        let metadata_signature = reader.read_vec_exact(metadata_signature_size)?;

        Ok(Self {
            version,
            manifest,
            metadata_signature,
            blob_offset,
        })
    }
}

/// Serialize a payload header followed by `blob`. The manifest is written as
/// is, so the caller is responsible for making the operations' data offsets
/// point into `blob`. This is mainly useful for building test payloads.
pub fn write_payload(
    mut writer: impl io::Write,
    manifest: &DeltaArchiveManifest,
    metadata_signature: &[u8],
    blob: &[u8],
) -> Result<()> {
    let manifest_raw = manifest.encode_to_vec();
    let signature_size =
        u32::try_from(metadata_signature.len()).map_err(|_| Error::IntegerTooLarge("signature"))?;

    writer.write_all(PAYLOAD_MAGIC)?;
    writer.write_all(&PAYLOAD_VERSION.to_be_bytes())?;
    writer.write_all(&(manifest_raw.len() as u64).to_be_bytes())?;
    writer.write_all(&signature_size.to_be_bytes())?;
    writer.write_all(&manifest_raw)?;
    writer.write_all(metadata_signature)?;
    writer.write_all(blob)?;

    Ok(())
}
