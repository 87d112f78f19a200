//! # Edge update agent
//!
//! This crate implements an update agent for Linux edge devices: it
//! atomically transitions a device between signed software Targets,
//! each binding an OSTree root filesystem commit with a set of compose
//! apps, with boot-counter based rollback when a new deployment fails
//! to come up.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

mod apps;
mod bootloader;
pub use bootloader::RollbackMode;
pub mod cli;
pub mod config;
mod download;
mod events;
mod metadata;
mod ostree;
mod registry;
mod rootfs;
mod storage;
mod target;
mod update;
