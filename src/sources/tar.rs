use anyhow::{anyhow, Result};
use log::warn;
use std::path::PathBuf;
use tempfile::TempDir;

use super::Source;

/// Pass-through source for pre-exported image tarballs.
pub struct TarSource;

impl TarSource {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }
}

impl Source for TarSource {
    fn name(&self) -> &str {
        "tar"
    }

    fn get_image_tarball(&self, image_path: &str) -> Result<(PathBuf, Option<TempDir>)> {
        let tarball_path = PathBuf::from(image_path);

        if !tarball_path.exists() {
            return Err(anyhow!(
                "tarball file does not exist: {}",
                tarball_path.display()
            ));
        }
        if !tarball_path.is_file() {
            return Err(anyhow!("path is not a file: {}", tarball_path.display()));
        }

        let extension = tarball_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        if extension != "tar" && extension != "gz" && extension != "tgz" {
            warn!(
                "file does not look like a tar export, proceeding anyway: {}",
                tarball_path.display()
            );
        }

        // An existing file needs no tempdir to keep it alive.
        Ok((tarball_path, None))
    }
}
