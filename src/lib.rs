//! The path-translation engine and its supporting subsystems for a
//! per-client virtual filesystem backed by a single canonical content tree
//! (§1–§2). The kernel-facing FUSE bridge, the configuration watcher, and
//! the HTTP control plane are external collaborators; this crate owns only
//! the core: `Config`, `PathParser`, `SourceResolver`, `DirSynthesizer`,
//! `ZipIndex`, the attribute/listing caches, the `Facade` those components
//! are assembled behind, and the `Write gate`.

pub mod caches;
pub mod config;
pub mod dir_synth;
pub mod error;
pub mod fs_ops;
pub mod path_parser;
pub mod source_resolver;
pub mod write_gate;
pub mod zip_index;
