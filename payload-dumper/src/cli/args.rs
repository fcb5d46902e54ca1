// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::File,
    io::{self, BufReader},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use clap::{ArgAction, Parser};
use tracing::{Level, debug};

use crate::{
    cli::{status, warning},
    dump::{self, DumpOptions},
    format::payload::PayloadHeader,
    patcher::ExternalPatcher,
    stream::{FromReader, ReadSeek},
    util::NumBytes,
};

/// Reconstruct partition images from an Android A/B OTA payload.
///
/// Full payloads only need the payload itself. Delta payloads also need the
/// old version of every partition as `<old>/<name>.img`.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to payload.bin.
    #[arg(value_name = "FILE", value_parser)]
    pub payload: PathBuf,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Directory containing the old partition images.
    #[arg(long, value_name = "DIR", value_parser, default_value = "old")]
    pub old: PathBuf,

    /// Output directory for the new partition images.
    #[arg(long, value_name = "DIR", value_parser, default_value = "out")]
    pub out: PathBuf,

    /// Verify the size and sha256 digest of every reconstructed image.
    #[arg(long)]
    pub check: bool,

    /// Only reconstruct the specified partition.
    ///
    /// Can be specified multiple times. All partitions are reconstructed if
    /// this is omitted.
    #[arg(short, long = "partition", value_name = "NAME")]
    pub partitions: Vec<String>,

    /// List the partitions in the payload and exit.
    #[arg(long)]
    pub list: bool,

    /// Number of partitions to reconstruct in parallel.
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// bspatch executable for SOURCE_BSDIFF and BROTLI_BSDIFF operations.
    #[arg(long, value_name = "PROGRAM", value_parser, default_value = "bspatch")]
    pub bspatch: OsString,

    /// puffin executable for PUFFDIFF operations.
    #[arg(long, value_name = "PROGRAM", value_parser, default_value = "puffin")]
    pub puffin: OsString,

    /// Seconds to wait for a patch tool before killing it (0 = no limit).
    #[arg(long, value_name = "SECONDS", default_value_t = 600)]
    pub patch_timeout: u64,
}

fn init_logging(verbosity: u8, logging_initialized: &AtomicBool) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    if tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .try_init()
        .is_ok()
    {
        logging_initialized.store(true, Ordering::SeqCst);
    }
}

fn list_partitions(header: &PayloadHeader) {
    for p in &header.manifest.partitions {
        let size = p
            .new_partition_info
            .as_ref()
            .and_then(|i| i.size)
            .unwrap_or_default();

        println!(
            "{}\t{}\t{} operations",
            p.partition_name,
            NumBytes(size),
            p.operations.len(),
        );
    }
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, logging_initialized);

    let start = Instant::now();

    let mut reader = File::open(&cli.payload)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.payload))?;
    let header = PayloadHeader::from_reader(&mut reader)
        .with_context(|| format!("Failed to load OTA payload header: {:?}", cli.payload))?;
    header.validate().context("Invalid payload manifest")?;

    match header.metadata_signatures() {
        Ok(s) => debug!("Metadata signature blob has {} signatures", s.signatures.len()),
        Err(e) => warning!("Metadata signature blob is malformed: {e}"),
    }

    if cli.list {
        list_partitions(&header);
        return Ok(());
    }

    status!(
        "Loaded {} payload with {} partitions (block size: {})",
        if header.is_full_ota() { "full" } else { "delta" },
        header.manifest.partitions.len(),
        NumBytes(header.block_size()),
    );

    let patcher = ExternalPatcher {
        bspatch: cli.bspatch.clone(),
        puffin: cli.puffin.clone(),
        timeout: (cli.patch_timeout != 0).then(|| Duration::from_secs(cli.patch_timeout)),
    };
    let options = DumpOptions {
        old_dir: cli.old.clone(),
        out_dir: cli.out.clone(),
        verify: cli.check,
        jobs: cli.jobs,
    };

    let reports = dump::dump_partitions(
        || {
            File::open(&cli.payload)
                .map(|f| Box::new(BufReader::new(f)) as Box<dyn ReadSeek>)
        },
        &header,
        &cli.partitions,
        &options,
        &patcher,
        cancel_signal,
    )
    .context("Failed to reconstruct partitions")?;

    let total = reports.len();
    let mut failed = 0;

    for report in reports {
        match report.result {
            Ok(Some(digest)) => status!(
                "{}: {:?} (sha256 {} matches)",
                report.name,
                report.path,
                STANDARD.encode(digest),
            ),
            Ok(None) => status!("{}: {:?}", report.name, report.path),
            Err(e) => {
                failed += 1;
                warning!("{}: {:#}", report.name, anyhow::Error::new(e));
            }
        }
    }

    if cancel_signal.load(Ordering::SeqCst) {
        bail!("Interrupted");
    } else if failed > 0 {
        bail!("Failed to reconstruct {failed} of {total} partitions");
    }

    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["payload-dumper", "payload.bin"]).unwrap();

        assert_eq!(cli.payload, PathBuf::from("payload.bin"));
        assert_eq!(cli.old, PathBuf::from("old"));
        assert_eq!(cli.out, PathBuf::from("out"));
        assert_eq!(cli.bspatch, "bspatch");
        assert_eq!(cli.patch_timeout, 600);
        assert_eq!(cli.verbose, 0);
        assert!(!cli.check);
        assert!(cli.partitions.is_empty());
    }

    #[test]
    fn repeated_flags() {
        let cli = Cli::try_parse_from([
            "payload-dumper",
            "-vv",
            "--check",
            "-p",
            "boot",
            "--partition",
            "vendor",
            "--out",
            "images",
            "payload.bin",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert!(cli.check);
        assert_eq!(cli.partitions, ["boot", "vendor"]);
        assert_eq!(cli.out, PathBuf::from("images"));
    }
}
