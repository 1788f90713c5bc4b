use anyhow::{anyhow, Context, Result};
use log::info;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

use super::Source;

/// Exports images through the `docker save` CLI.
pub struct DockerSource;

impl DockerSource {
    pub fn new() -> Result<Self> {
        let output = Command::new("docker")
            .arg("--version")
            .output()
            .context("failed to execute docker. Is Docker installed and running?")?;
        if !output.status.success() {
            return Err(anyhow!("docker is not available"));
        }
        Ok(Self)
    }

    fn run_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .with_context(|| format!("failed to execute docker command: {args:?}"))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("docker command failed: {error}"));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Source for DockerSource {
    fn name(&self) -> &str {
        "docker"
    }

    fn get_image_tarball(&self, image: &str) -> Result<(PathBuf, Option<TempDir>)> {
        let temp_dir = TempDir::new().context("failed to create temporary directory")?;
        let tarball_path = temp_dir.path().join("image.tar");

        info!("exporting image '{image}' to tarball");
        let tarball_str = tarball_path
            .to_str()
            .ok_or_else(|| anyhow!("non-UTF8 temp path"))?;
        self.run_command(&["save", "-o", tarball_str, image])?;

        // The tempdir travels with the path so the export stays alive.
        Ok((tarball_path, Some(temp_dir)))
    }
}
