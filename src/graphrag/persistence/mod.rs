//! Archive and restore of built graphs.

pub mod archive;

pub use archive::{ArchiveManifest, read_archive, write_archive};
