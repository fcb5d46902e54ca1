// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Handlers for individual [`InstallOperation`]s.
//!
//! The bytes of an operation form a single logical buffer that is split across
//! its extent list in order. Nothing read from the payload or from a source
//! image is written anywhere before its SHA-256 digest has been checked.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use bzip2::read::BzDecoder;
use liblzma::read::XzDecoder;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::{
    digest::{self, DigestKind},
    format::{
        extent::{self, ByteRange},
        padding,
    },
    patcher::{self, PatchKind, PatchRequest, Patcher},
    protobuf::chromeos_update_engine::{InstallOperation, install_operation::Type},
    stream::{self, HashingWriter, WriteZerosExt},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Source image not found: {0:?}")]
    MissingSourceImage(PathBuf),
    #[error("{0:?} field is missing")]
    MissingField(&'static str),
    #[error("Operation data ({data} bytes) exceeds destination extents ({capacity} bytes)")]
    DataTooLarge { data: u64, capacity: u64 },
    #[error("Invalid extent")]
    Extent(#[from] extent::Error),
    #[error("Integrity check failed")]
    Digest(#[from] digest::Error),
    #[error("Failed to apply patch")]
    Patcher(#[from] patcher::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The old version of the partition being reconstructed. The file is only
/// opened by operations that need it, so delta payloads can still be applied
/// partially when some old images are absent.
#[derive(Clone, Debug)]
pub struct SourceImage {
    path: PathBuf,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::MissingSourceImage(self.path.clone())
            } else {
                Error::Io(e)
            }
        })
    }
}

/// Everything besides the data streams that an operation needs.
pub struct OperationContext<'a> {
    pub block_size: u32,
    /// Path to the image being written. Only used for passing to the patcher.
    pub new_image: &'a Path,
    pub source: &'a SourceImage,
    pub patcher: &'a dyn Patcher,
    pub cancel_signal: &'a AtomicBool,
}

/// Apply a single operation. `payload` must already be positioned at the
/// operation's data in the blob section. `image` is the new image, which is
/// both read from (for `MOVE`) and written to.
pub fn apply_operation(
    payload: impl Read,
    mut image: impl Read + Write + Seek,
    op: &InstallOperation,
    ctx: &OperationContext,
) -> Result<()> {
    let op_type = op
        .operation_type()
        .map_err(|_| Error::UnsupportedOperation(op.type_name()))?;

    match op_type {
        Type::Replace | Type::ReplaceBz | Type::ReplaceXz => {
            let dst = extent::extent_ranges(&op.dst_extents, ctx.block_size)?;
            let data = read_data(payload, op, ctx.cancel_signal)?;
            let capacity = extent::extents_length(&op.dst_extents, ctx.block_size)?;
            let data = decompress(op_type, data, capacity)?;

            write_extents(&mut image, &data, &dst, Some(ctx.block_size), ctx)
        }
        Type::Move => {
            // Blocks are moved within the new image, which may include data
            // written by earlier operations.
            let data = read_source(&mut image, op, ctx)?;
            let dst = extent::extent_ranges(&op.dst_extents, ctx.block_size)?;

            write_extents(&mut image, &data, &dst, None, ctx)
        }
        Type::SourceCopy => {
            let data = read_source(ctx.source.open()?, op, ctx)?;
            let dst = extent::extent_ranges(&op.dst_extents, ctx.block_size)?;

            write_extents(&mut image, &data, &dst, None, ctx)
        }
        Type::SourceBsdiff | Type::BrotliBsdiff => {
            source_diff(payload, image, op, PatchKind::Bsdiff, ctx)
        }
        Type::Puffdiff => source_diff(payload, image, op, PatchKind::Puffin, ctx),
        Type::Zero | Type::Discard => {
            let dst = extent::extent_ranges(&op.dst_extents, ctx.block_size)?;

            for range in dst {
                stream::check_cancel(ctx.cancel_signal)?;

                image.seek(SeekFrom::Start(range.offset))?;
                image.write_zeros(range.length)?;
            }

            Ok(())
        }
        // BSDIFF operates on in-memory buffers and hasn't been emitted by the
        // payload generator since minor version 3.
        Type::Bsdiff
        | Type::Zucchini
        | Type::Lz4diffBsdiff
        | Type::Lz4diffPuffdiff
        | Type::Zstd => Err(Error::UnsupportedOperation(op.type_name())),
    }
}

/// Read and verify the operation's data from the blob section.
fn read_data(
    reader: impl Read,
    op: &InstallOperation,
    cancel_signal: &AtomicBool,
) -> Result<Vec<u8>> {
    let length = op.data_length.ok_or(Error::MissingField("data_length"))?;
    let mut writer = HashingWriter::new(Vec::new());

    stream::copy_exact(reader, &mut writer, length, cancel_signal)?;

    let (data, digest) = writer.finish();
    digest::verify_digest(
        DigestKind::PayloadData,
        &digest,
        op.data_sha256_hash.as_deref(),
    )?;

    Ok(data)
}

/// Decompress the data of REPLACE_BZ and REPLACE_XZ operations. At most one
/// byte more than `capacity` is ever decompressed.
fn decompress(op_type: Type, data: Vec<u8>, capacity: u64) -> Result<Vec<u8>> {
    let limit = capacity.saturating_add(1);
    let mut result = Vec::new();

    match op_type {
        Type::ReplaceBz => {
            BzDecoder::new(data.as_slice())
                .take(limit)
                .read_to_end(&mut result)?;
        }
        Type::ReplaceXz => {
            XzDecoder::new(data.as_slice())
                .take(limit)
                .read_to_end(&mut result)?;
        }
        _ => return Ok(data),
    }

    if result.len() as u64 > capacity {
        return Err(Error::DataTooLarge {
            data: result.len() as u64,
            capacity,
        });
    }

    Ok(result)
}

/// Read the operation's source extents from `reader` into `writer` and verify
/// the concatenated data against `src_sha256_hash`.
fn copy_source(
    mut reader: impl Read + Seek,
    writer: impl Write,
    op: &InstallOperation,
    ctx: &OperationContext,
) -> Result<()> {
    let ranges = extent::extent_ranges(&op.src_extents, ctx.block_size)?;
    let mut writer = HashingWriter::new(writer);

    for range in ranges {
        reader.seek(SeekFrom::Start(range.offset))?;
        stream::copy_exact(&mut reader, &mut writer, range.length, ctx.cancel_signal)?;
    }

    let (_, digest) = writer.finish();
    digest::verify_digest(
        DigestKind::SourceData,
        &digest,
        op.src_sha256_hash.as_deref(),
    )?;

    Ok(())
}

fn read_source(
    reader: impl Read + Seek,
    op: &InstallOperation,
    ctx: &OperationContext,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    copy_source(reader, &mut data, op, ctx)?;
    Ok(data)
}

/// Write `data` across `ranges` in order. If `pad_block_size` is set and the
/// data ends in the middle of a block, the rest of that block is zeroed.
fn write_extents(
    mut writer: impl Write + Seek,
    mut data: &[u8],
    ranges: &[ByteRange],
    pad_block_size: Option<u32>,
    ctx: &OperationContext,
) -> Result<()> {
    let capacity = ranges.iter().map(|r| r.length).sum::<u64>();
    if data.len() as u64 > capacity {
        return Err(Error::DataTooLarge {
            data: data.len() as u64,
            capacity,
        });
    }

    for range in ranges {
        if data.is_empty() {
            break;
        }

        stream::check_cancel(ctx.cancel_signal)?;

        let n = range.length.min(data.len() as u64) as usize;

        writer.seek(SeekFrom::Start(range.offset))?;
        writer.write_all(&data[..n])?;

        if let Some(block_size) = pad_block_size {
            padding::write_zeros(&mut writer, n as u64, block_size.into())?;
        }

        data = &data[n..];
    }

    Ok(())
}

/// Verify the source data and the patch, then hand them off to the patcher,
/// which writes directly into the new image.
fn source_diff(
    payload: impl Read,
    mut image: impl Write,
    op: &InstallOperation,
    kind: PatchKind,
    ctx: &OperationContext,
) -> Result<()> {
    // The patcher reads the old image by itself. This is purely to fail early
    // if the old image isn't the expected version.
    copy_source(ctx.source.open()?, io::sink(), op, ctx)?;

    let length = op.data_length.ok_or(Error::MissingField("data_length"))?;
    let mut patch_file = NamedTempFile::new()?;

    let mut writer = HashingWriter::new(patch_file.as_file_mut());
    stream::copy_exact(payload, &mut writer, length, ctx.cancel_signal)?;
    writer.flush()?;

    let (_, digest) = writer.finish();
    digest::verify_digest(
        DigestKind::PayloadData,
        &digest,
        op.data_sha256_hash.as_deref(),
    )?;

    let src_ranges = extent::extent_ranges(&op.src_extents, ctx.block_size)?;
    let dst_ranges = extent::extent_ranges(&op.dst_extents, ctx.block_size)?;
    let src_ranges = extent::format_ranges(&src_ranges);
    let dst_ranges = extent::format_ranges(&dst_ranges);

    // Anything buffered must hit the file before another process writes to it.
    image.flush()?;

    ctx.patcher.apply(
        &PatchRequest {
            kind,
            old_image: ctx.source.path(),
            new_image: ctx.new_image,
            patch: patch_file.path(),
            src_ranges: &src_ranges,
            dst_ranges: &dst_ranges,
        },
        ctx.cancel_signal,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::{Cursor, Write},
        sync::{Mutex, atomic::AtomicBool},
    };

    use assert_matches::assert_matches;
    use bzip2::{Compression, write::BzEncoder};
    use liblzma::write::XzEncoder;

    use crate::{
        digest::sha256,
        protobuf::chromeos_update_engine::Extent,
        util,
    };

    use super::*;

    const BLOCK_SIZE: u32 = 16;

    #[derive(Default)]
    struct RecordingPatcher {
        requests: Mutex<Vec<(PatchKind, String, String, Vec<u8>)>>,
    }

    impl Patcher for RecordingPatcher {
        fn apply(
            &self,
            request: &PatchRequest,
            _cancel_signal: &AtomicBool,
        ) -> std::result::Result<(), patcher::Error> {
            let patch = fs::read(request.patch)?;

            self.requests.lock().unwrap().push((
                request.kind,
                request.src_ranges.to_owned(),
                request.dst_ranges.to_owned(),
                patch,
            ));

            Ok(())
        }
    }

    fn extent(start_block: u64, num_blocks: u64) -> Extent {
        Extent {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    fn data_op(op_type: Type, data: &[u8], dst_extents: Vec<Extent>) -> InstallOperation {
        InstallOperation {
            r#type: op_type.into(),
            data_offset: Some(0),
            data_length: Some(data.len() as u64),
            data_sha256_hash: Some(sha256(data).to_vec()),
            dst_extents,
            ..Default::default()
        }
    }

    fn copy_op(
        op_type: Type,
        src: &[u8],
        src_extents: Vec<Extent>,
        dst_extents: Vec<Extent>,
    ) -> InstallOperation {
        InstallOperation {
            r#type: op_type.into(),
            src_extents,
            src_sha256_hash: Some(sha256(src).to_vec()),
            dst_extents,
            ..Default::default()
        }
    }

    struct Harness {
        cancel_signal: AtomicBool,
        source: SourceImage,
        patcher: RecordingPatcher,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(old_image: Option<&[u8]>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("system.img");

            if let Some(data) = old_image {
                fs::write(&path, data).unwrap();
            }

            Self {
                cancel_signal: AtomicBool::new(false),
                source: SourceImage::new(path),
                patcher: RecordingPatcher::default(),
                _dir: dir,
            }
        }

        fn apply(
            &self,
            payload: &[u8],
            image: &mut Cursor<Vec<u8>>,
            op: &InstallOperation,
        ) -> Result<()> {
            let ctx = OperationContext {
                block_size: BLOCK_SIZE,
                new_image: Path::new("new/system.img"),
                source: &self.source,
                patcher: &self.patcher,
                cancel_signal: &self.cancel_signal,
            };

            apply_operation(payload, image, op, &ctx)
        }
    }

    #[test]
    fn replace_pads_to_block_size() {
        let harness = Harness::new(None);
        let data = b"0123456789abcdefXYZ";
        let op = data_op(Type::Replace, data, vec![extent(1, 2)]);
        let mut image = Cursor::new(vec![0xffu8; 64]);

        harness.apply(data, &mut image, &op).unwrap();

        let image = image.into_inner();
        assert_eq!(&image[..16], &[0xffu8; 16]);
        assert_eq!(&image[16..35], data);
        // ceil(19 / 16) * 16 = 32 bytes written.
        assert!(util::is_zero(&image[35..48]));
        assert_eq!(&image[48..], &[0xffu8; 16]);
    }

    #[test]
    fn replace_splits_across_extents() {
        let harness = Harness::new(None);
        let data = [1u8; 40];
        let op = data_op(Type::Replace, &data, vec![extent(3, 1), extent(0, 2)]);
        let mut image = Cursor::new(Vec::new());

        harness.apply(&data, &mut image, &op).unwrap();

        let image = image.into_inner();
        assert_eq!(image.len(), 64);
        assert_eq!(&image[48..64], &[1u8; 16]);
        assert_eq!(&image[..24], &[1u8; 24]);
        assert!(util::is_zero(&image[24..48]));
    }

    #[test]
    fn replace_compressed() {
        let harness = Harness::new(None);
        let plain = b"compressed partition data".repeat(3);

        let mut bz = BzEncoder::new(Vec::new(), Compression::best());
        bz.write_all(&plain).unwrap();
        let bz = bz.finish().unwrap();

        let mut xz = XzEncoder::new(Vec::new(), 6);
        xz.write_all(&plain).unwrap();
        let xz = xz.finish().unwrap();

        for (op_type, data) in [(Type::ReplaceBz, bz), (Type::ReplaceXz, xz)] {
            let op = data_op(op_type, &data, vec![extent(0, 5)]);
            let mut image = Cursor::new(Vec::new());

            harness.apply(&data, &mut image, &op).unwrap();

            let image = image.into_inner();
            assert_eq!(image.len(), 80);
            assert_eq!(&image[..plain.len()], plain.as_slice());
            assert!(util::is_zero(&image[plain.len()..]));
        }
    }

    #[test]
    fn replace_rejects_corrupted_data() {
        let harness = Harness::new(None);
        let data = [7u8; 16];
        let op = data_op(Type::Replace, &data, vec![extent(0, 1)]);
        let mut image = Cursor::new(Vec::new());

        let mut corrupted = data;
        corrupted[5] ^= 1;

        assert_matches!(
            harness.apply(&corrupted, &mut image, &op),
            Err(Error::Digest(digest::Error::Mismatch {
                kind: DigestKind::PayloadData,
                ..
            }))
        );
        assert!(image.into_inner().is_empty());
    }

    #[test]
    fn replace_rejects_oversized_data() {
        let harness = Harness::new(None);
        let data = [7u8; 17];
        let op = data_op(Type::Replace, &data, vec![extent(0, 1)]);
        let mut image = Cursor::new(Vec::new());

        assert_matches!(
            harness.apply(&data, &mut image, &op),
            Err(Error::DataTooLarge {
                data: 17,
                capacity: 16
            })
        );
    }

    #[test]
    fn replace_rejects_decompression_bomb() {
        let harness = Harness::new(None);
        let plain = vec![0u8; 8 * 1024 * 1024];

        let mut bz = BzEncoder::new(Vec::new(), Compression::best());
        bz.write_all(&plain).unwrap();
        let bz = bz.finish().unwrap();

        let mut xz = XzEncoder::new(Vec::new(), 6);
        xz.write_all(&plain).unwrap();
        let xz = xz.finish().unwrap();

        for (op_type, data) in [(Type::ReplaceBz, bz), (Type::ReplaceXz, xz)] {
            assert!(data.len() < plain.len() / 100);

            let op = data_op(op_type, &data, vec![extent(0, 2)]);
            let mut image = Cursor::new(Vec::new());

            // Decompression stops right after the extents are full.
            assert_matches!(
                harness.apply(&data, &mut image, &op),
                Err(Error::DataTooLarge {
                    data: 33,
                    capacity: 32
                })
            );
            assert!(image.into_inner().is_empty());
        }
    }

    #[test]
    fn move_after_replace() {
        let harness = Harness::new(None);
        let data = b"abcdefghijklmnopABCDEFGHIJKLMNOP";
        let replace = data_op(Type::Replace, data, vec![extent(0, 2)]);
        let mut image = Cursor::new(Vec::new());

        harness.apply(data, &mut image, &replace).unwrap();

        let moved = copy_op(Type::Move, data, vec![extent(0, 2)], vec![extent(4, 1), extent(2, 1)]);
        harness.apply(b"", &mut image, &moved).unwrap();

        let image = image.into_inner();
        assert_eq!(&image[64..80], &data[..16]);
        assert_eq!(&image[32..48], &data[16..]);
    }

    #[test]
    fn move_rejects_wrong_source() {
        let harness = Harness::new(None);
        let mut image = Cursor::new(vec![3u8; 32]);
        let op = copy_op(Type::Move, &[4u8; 16], vec![extent(0, 1)], vec![extent(1, 1)]);

        assert_matches!(
            harness.apply(b"", &mut image, &op),
            Err(Error::Digest(digest::Error::Mismatch {
                kind: DigestKind::SourceData,
                ..
            }))
        );
        assert_eq!(image.into_inner(), [3u8; 32]);
    }

    #[test]
    fn source_copy() {
        let mut old = vec![0u8; 48];
        old[16..32].copy_from_slice(&[9u8; 16]);
        old[32..48].copy_from_slice(&[8u8; 16]);

        let harness = Harness::new(Some(&old));
        let op = copy_op(Type::SourceCopy, &old[16..48], vec![extent(1, 2)], vec![extent(0, 2)]);
        let mut image = Cursor::new(Vec::new());

        harness.apply(b"", &mut image, &op).unwrap();
        assert_eq!(image.into_inner(), &old[16..48]);
    }

    #[test]
    fn source_copy_missing_old_image() {
        let harness = Harness::new(None);
        let op = copy_op(Type::SourceCopy, &[0u8; 16], vec![extent(0, 1)], vec![extent(0, 1)]);
        let mut image = Cursor::new(Vec::new());

        assert_matches!(
            harness.apply(b"", &mut image, &op),
            Err(Error::MissingSourceImage(p)) if p == harness.source.path()
        );
    }

    #[test]
    fn source_diff_invokes_patcher() {
        let old = [5u8; 64];
        let patch = b"BSDF2 patch bytes";
        let harness = Harness::new(Some(&old));

        for (op_type, kind) in [
            (Type::SourceBsdiff, PatchKind::Bsdiff),
            (Type::BrotliBsdiff, PatchKind::Bsdiff),
            (Type::Puffdiff, PatchKind::Puffin),
        ] {
            let mut op = data_op(op_type, patch, vec![extent(2, 2)]);
            op.src_extents = vec![extent(3, 1), extent(0, 1)];
            op.src_sha256_hash = Some(sha256(&old[..32]).to_vec());

            let mut image = Cursor::new(Vec::new());
            harness.apply(patch, &mut image, &op).unwrap();

            let requests = harness.patcher.requests.lock().unwrap();
            let last = requests.last().unwrap();
            assert_eq!(last.0, kind);
            assert_eq!(last.1, "48:16,0:16");
            assert_eq!(last.2, "32:32");
            assert_eq!(last.3, patch);
        }

        assert_eq!(harness.patcher.requests.lock().unwrap().len(), 3);
    }

    #[test]
    fn source_diff_checks_old_image_first() {
        let harness = Harness::new(Some(&[5u8; 16]));
        let patch = b"patch";
        let mut op = data_op(Type::SourceBsdiff, patch, vec![extent(0, 1)]);
        op.src_extents = vec![extent(0, 1)];
        op.src_sha256_hash = Some(sha256(&[6u8; 16]).to_vec());

        let mut image = Cursor::new(Vec::new());
        assert_matches!(
            harness.apply(patch, &mut image, &op),
            Err(Error::Digest(digest::Error::Mismatch {
                kind: DigestKind::SourceData,
                ..
            }))
        );
        assert!(harness.patcher.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn source_diff_rejects_corrupted_patch() {
        let old = [5u8; 16];
        let harness = Harness::new(Some(&old));
        let patch = b"patch";
        let mut op = data_op(Type::Puffdiff, patch, vec![extent(0, 1)]);
        op.src_extents = vec![extent(0, 1)];
        op.src_sha256_hash = Some(sha256(&old).to_vec());

        let mut image = Cursor::new(Vec::new());
        assert_matches!(
            harness.apply(b"patcH", &mut image, &op),
            Err(Error::Digest(digest::Error::Mismatch {
                kind: DigestKind::PayloadData,
                ..
            }))
        );
        assert!(harness.patcher.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn zero_and_discard() {
        let harness = Harness::new(None);

        for op_type in [Type::Zero, Type::Discard] {
            let op = InstallOperation {
                r#type: op_type.into(),
                dst_extents: vec![extent(1, 1), extent(3, 1)],
                ..Default::default()
            };
            let mut image = Cursor::new(vec![0xffu8; 64]);

            harness.apply(b"", &mut image, &op).unwrap();

            let image = image.into_inner();
            assert_eq!(&image[..16], &[0xffu8; 16]);
            assert!(util::is_zero(&image[16..32]));
            assert_eq!(&image[32..48], &[0xffu8; 16]);
            assert!(util::is_zero(&image[48..64]));
        }
    }

    #[test]
    fn unsupported_operations() {
        let harness = Harness::new(None);

        for op_type in [Type::Bsdiff, Type::Zucchini, Type::Zstd] {
            let op = InstallOperation {
                r#type: op_type.into(),
                dst_extents: vec![extent(0, 1)],
                ..Default::default()
            };
            let mut image = Cursor::new(Vec::new());

            assert_matches!(
                harness.apply(b"", &mut image, &op),
                Err(Error::UnsupportedOperation(n)) if n == op_type.as_str_name()
            );
            assert!(image.into_inner().is_empty());
        }

        let op = InstallOperation {
            r#type: 1000,
            ..Default::default()
        };
        assert_matches!(
            harness.apply(b"", &mut Cursor::new(Vec::new()), &op),
            Err(Error::UnsupportedOperation(_))
        );
    }
}
