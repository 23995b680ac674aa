// SPDX-License-Identifier: GPL-3.0-only

pub mod output;

pub use output::comp::{
    load_outputs, ConfigError, OutputConfig, OutputInfo, OutputState,
    OutputsConfig, TransformDef,
};
