// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Since payload-dumper is primarily an application and not a library, the
//! semver versioning covers the CLI only. All Rust APIs can change at any time,
//! even in patch releases.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod apply;
pub mod cli;
pub mod digest;
pub mod dump;
pub mod format;
pub mod partition;
pub mod patcher;
pub mod protobuf;
pub mod stream;
pub mod util;
