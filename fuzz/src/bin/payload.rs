// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use honggfuzz::fuzz;
    use payload_dumper::{
        format::{extent, payload::PayloadHeader},
        stream::FromReader,
    };

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let reader = Cursor::new(data);
                let Ok(header) = PayloadHeader::from_reader(reader) else {
                    return;
                };

                if header.validate().is_err() {
                    return;
                }

                let _ = header.metadata_signatures();

                for partition in &header.manifest.partitions {
                    for op in &partition.operations {
                        let _ = extent::extent_ranges(&op.dst_extents, header.block_size())
                            .map(|r| extent::format_ranges(&r));
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
