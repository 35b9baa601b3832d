use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use projhub_core::{DevSideConfig, ProjectId};

/// Configuration of the projhub admin tool.
#[derive(Parser, Debug, Clone)]
#[command(name = "projhub")]
#[command(about = "Create and administer projhub projects")]
pub struct Config {
    /// Registry root directory (metadata store and project directories)
    #[arg(long, env = "PROJHUB_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// JSON file with the development-side cloud configuration
    #[arg(long, env = "PROJHUB_DEV_CONFIG")]
    pub dev_config: Option<PathBuf>,

    /// Maximum size of a project filesystem in bytes, 0 for unbounded
    #[arg(long, default_value = "0", env = "PROJHUB_MAX_FS_SIZE")]
    pub max_fs_size: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a project and print its id
    Create {
        /// Project name: a letter followed by letters, digits, '_' or '-'
        #[arg(long)]
        name: String,

        /// Template to scaffold the project from
        #[arg(long, default_value = "")]
        template: String,

        /// Add the tutorial file
        #[arg(long)]
        tut: bool,
    },

    /// List the ids of all projects
    List,

    /// Print a project's record
    Show { id: ProjectId },

    /// Get or create S3 credentials for a project bucket
    Credentials {
        id: ProjectId,
        bucket: String,

        #[arg(long, default_value = "cloudflare")]
        provider: String,
    },

    /// Delete a project's secrets bucket
    DeleteSecretsBucket { id: ProjectId },

    /// Delete every Cloudflare token issued for a project
    ResetCloudflare { id: ProjectId },
}

impl Config {
    /// Registry root, defaulting to `<data dir>/projhub`.
    pub fn root_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.root_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("projhub"))
                .context("no data directory on this platform, pass --root-dir"),
        }
    }

    /// Development-side configuration, empty when no file is given.
    pub fn dev_side_config(&self) -> anyhow::Result<DevSideConfig> {
        match &self.dev_config {
            Some(path) => load_dev_side_config(path),
            None => Ok(DevSideConfig::default()),
        }
    }
}

pub fn load_dev_side_config(path: &Path) -> anyhow::Result<DevSideConfig> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid dev config {}", path.display()))
}
