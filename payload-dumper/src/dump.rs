// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeSet, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use rayon::{ThreadPoolBuildError, ThreadPoolBuilder, prelude::*};
use thiserror::Error;
use tracing::debug;

use crate::{
    digest::SHA256_LEN,
    format::payload::PayloadHeader,
    partition::{self, Reconstructor},
    patcher::Patcher,
    protobuf::chromeos_update_engine::PartitionUpdate,
    stream::ReadSeek,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Partitions not found in payload: {0:?}")]
    MissingPartitions(BTreeSet<String>),
    #[error("Failed to create directory: {0:?}")]
    CreateDirectory(PathBuf, #[source] io::Error),
    #[error("Failed to create thread pool")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct DumpOptions {
    /// Directory containing `<name>.img` for each old partition.
    pub old_dir: PathBuf,
    /// Directory to write `<name>.img` for each new partition to.
    pub out_dir: PathBuf,
    /// Whether to check the finished images against the manifest.
    pub verify: bool,
    /// Number of partitions to reconstruct in parallel. Uses rayon's default
    /// if unset.
    pub jobs: Option<usize>,
}

/// Outcome of a single partition.
#[derive(Debug)]
pub struct PartitionReport {
    pub name: String,
    pub path: PathBuf,
    /// The image digest if verification was requested and succeeded.
    pub result: std::result::Result<Option<[u8; SHA256_LEN]>, partition::Error>,
}

/// Select partitions by name in manifest order. If `names` is empty, every
/// partition is selected.
pub fn select_partitions<'a>(
    header: &'a PayloadHeader,
    names: &[String],
) -> Result<Vec<&'a PartitionUpdate>> {
    if names.is_empty() {
        return Ok(header.manifest.partitions.iter().collect());
    }

    let missing = names
        .iter()
        .filter(|n| header.partition(n).is_none())
        .cloned()
        .collect::<BTreeSet<_>>();
    if !missing.is_empty() {
        return Err(Error::MissingPartitions(missing));
    }

    let wanted = names.iter().map(|n| n.as_str()).collect::<HashSet<_>>();

    Ok(header
        .manifest
        .partitions
        .iter()
        .filter(|p| wanted.contains(p.partition_name.as_str()))
        .collect())
}

fn dump_partition(
    open_payload: &(impl Fn() -> io::Result<Box<dyn ReadSeek>> + Sync),
    header: &PayloadHeader,
    partition: &PartitionUpdate,
    options: &DumpOptions,
    patcher: &dyn Patcher,
    cancel_signal: &AtomicBool,
) -> PartitionReport {
    let name = partition.partition_name.clone();
    let fallback_path = options.out_dir.join(format!("{name}.img"));

    let result = Reconstructor::new(
        header,
        partition,
        &options.old_dir,
        &options.out_dir,
        patcher,
        options.verify,
    )
    .and_then(|mut reconstructor| {
        let reader = open_payload()?;
        let digest = reconstructor.run(reader, cancel_signal)?;

        Ok((reconstructor.output_path().to_owned(), digest))
    });

    match result {
        Ok((path, digest)) => PartitionReport {
            name,
            path,
            result: Ok(digest),
        },
        Err(e) => PartitionReport {
            name,
            path: fallback_path,
            result: Err(e),
        },
    }
}

/// Reconstruct the selected partitions into [`DumpOptions::out_dir`].
///
/// Partitions are processed in parallel and independently of each other. A
/// partition that fails does not affect the others, so the returned reports
/// must be checked. Errors are only returned for problems that prevent any
/// partition from being attempted. `open_payload` is called once per partition
/// from multiple threads.
pub fn dump_partitions(
    open_payload: impl Fn() -> io::Result<Box<dyn ReadSeek>> + Sync,
    header: &PayloadHeader,
    names: &[String],
    options: &DumpOptions,
    patcher: &dyn Patcher,
    cancel_signal: &AtomicBool,
) -> Result<Vec<PartitionReport>> {
    let partitions = select_partitions(header, names)?;

    create_dir(&options.out_dir)?;

    let mut builder = ThreadPoolBuilder::new();
    if let Some(jobs) = options.jobs {
        builder = builder.num_threads(jobs);
    }
    let pool = builder.build()?;

    debug!(
        "Reconstructing {} partitions with {} threads",
        partitions.len(),
        pool.current_num_threads(),
    );

    let reports = pool.install(|| {
        partitions
            .par_iter()
            .map(|p| dump_partition(&open_payload, header, p, options, patcher, cancel_signal))
            .collect()
    });

    Ok(reports)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::CreateDirectory(path.to_owned(), e))
}
