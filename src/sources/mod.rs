//! Image acquisition: how an exported image tarball reaches the engine.
//!
//! The engine only ever sees a tarball path; a [`Source`] knows how to
//! produce one (asking a container engine to export, or passing through a
//! pre-exported file).

mod docker;
mod tar;

pub use docker::DockerSource;
pub use tar::TarSource;

use anyhow::Result;
use std::path::PathBuf;
use tempfile::TempDir;

/// A provider of exported image tarballs.
pub trait Source {
    fn name(&self) -> &str;

    /// Resolves an image reference to an exported tarball path.
    ///
    /// The optional [`TempDir`] keeps a freshly exported tarball alive; the
    /// caller must hold it for as long as the path is used.
    fn get_image_tarball(&self, image: &str) -> Result<(PathBuf, Option<TempDir>)>;
}
