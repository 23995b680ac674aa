// SPDX-License-Identifier: GPL-3.0-only

//! Reconciles the outputs of an X screen with a requested layout through
//! the RandR extension.
//!
//! Changes are staged per output on a [`display::Display`] and committed in
//! one pass by [`display::Display::apply_changed`], which also keeps the
//! screen size in step with the union of all outputs.

pub mod backend;
pub mod config;
pub mod display;
pub mod error;
pub mod logger;
pub mod output;
pub mod utils;
