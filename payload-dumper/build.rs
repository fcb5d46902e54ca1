// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{env, ffi::OsStr, fs, path::Path};

fn main() {
    let in_dir = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap()).join("protobuf");

    println!("cargo:rerun-if-changed={}", in_dir.to_str().unwrap());

    let mut protos = Vec::new();

    for entry in fs::read_dir(&in_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension() == Some(OsStr::new("proto")) {
            println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
            protos.push(path);
        }
    }

    // protox is a pure Rust protobuf compiler, so protoc doesn't need to be
    // installed on the build machine.
    let fds = protox::compile(&protos, [&in_dir]).unwrap();

    prost_build::Config::new().compile_fds(fds).unwrap();
}
