//! Scoped sketch/build directories.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tempfile::TempDir;

use crate::error::Result;

/// Name of the sketch directory and its `.ino` file inside a workspace.
const SKETCH_NAME: &str = "sketch";

/// A private, uniquely named sketch directory plus build directory.
///
/// Both live under one temporary root that is deleted when the workspace is
/// dropped, so every exit path (success, failure, early return, panic)
/// removes them.
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
    sketch_dir: PathBuf,
    build_dir: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace under `parent` (system temp dir when `None`).
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("flashbridge-");
            b
        };
        let root = match parent {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            },
            None => builder.tempdir()?,
        };

        let sketch_dir = root.path().join(SKETCH_NAME);
        let build_dir = root.path().join("build");
        fs::create_dir(&sketch_dir)?;
        fs::create_dir(&build_dir)?;
        debug!("Created workspace {}", root.path().display());

        Ok(Self {
            root,
            sketch_dir,
            build_dir,
        })
    }

    /// Write validated source into the sketch directory.
    pub fn write_sketch(&self, code: &str) -> Result<PathBuf> {
        let file = self.sketch_file();
        fs::write(&file, code)?;
        Ok(file)
    }

    /// Root directory holding both sketch and build directories.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Sketch directory passed to the tool.
    pub fn sketch_dir(&self) -> &Path {
        &self.sketch_dir
    }

    /// Build output directory.
    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Main sketch file; its stem must match the directory name.
    pub fn sketch_file(&self) -> PathBuf {
        self.sketch_dir.join(format!("{SKETCH_NAME}.ino"))
    }

    /// Remove the workspace now, reporting removal errors.
    pub fn close(self) -> Result<()> {
        let path = self.root.path().to_path_buf();
        if let Err(e) = self.root.close() {
            warn!("Failed to remove workspace {}: {e}", path.display());
            return Err(e.into());
        }
        debug!("Removed workspace {}", path.display());
        Ok(())
    }
}
