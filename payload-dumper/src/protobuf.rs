// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(clippy::all)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

pub mod chromeos_update_engine {
    include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));
}

use chromeos_update_engine::install_operation::Type;

impl chromeos_update_engine::InstallOperation {
    /// Get the operation type, or the raw value if it is not a type known to
    /// this version of the schema.
    pub fn operation_type(&self) -> Result<Type, i32> {
        Type::try_from(self.r#type).map_err(|_| self.r#type)
    }

    /// Get a human-readable name for the operation type. Unknown types are
    /// rendered as their numeric value.
    pub fn type_name(&self) -> String {
        match self.operation_type() {
            Ok(t) => t.as_str_name().to_owned(),
            Err(raw) => format!("<unknown {raw}>"),
        }
    }
}
