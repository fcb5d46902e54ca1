// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::{self, ExitCode},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::error;

/// Exit status used when a second interrupt arrives before the workers have
/// stopped.
const FORCED_EXIT_STATUS: i32 = 130;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    // The first interrupt lets every worker stop at its next chunk and remove
    // its partially written image. A second one exits immediately.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = cancel_signal.clone();

    ctrlc::set_handler(move || {
        if handler_signal.swap(true, Ordering::SeqCst) {
            process::exit(FORCED_EXIT_STATUS);
        }
    })
    .expect("Failed to set signal handler");

    let Err(e) = payload_dumper::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal) else {
        return ExitCode::SUCCESS;
    };

    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        error!("{e:?}");
    } else {
        eprintln!("{e:?}");
    }

    ExitCode::FAILURE
}
