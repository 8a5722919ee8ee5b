use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::models::Migration;
use crate::sources::Source;

/// A source that scans a directory of migration scripts.
///
/// Every regular file in the directory must follow the
/// `<version>_<name>.(up|down).<ext>` naming convention; anything else fails
/// discovery rather than being silently skipped.
pub struct FileSource {
    path: PathBuf,
    migrations: Vec<Migration>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource, Error> {
        let path = path.as_ref().to_path_buf();
        let entries = fs::read_dir(&path).map_err(|err| {
            Error::app_with(
                "source",
                format!("failed to read migrations directory {}", path.display()),
                err,
            )
        })?;

        let mut migrations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::app_with("source", "failed to list migrations directory", err)
            })?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let raw_name = entry.file_name().to_string_lossy().into_owned();
            let bytes = fs::read(entry.path()).map_err(|err| {
                Error::app_with(
                    "source",
                    format!("failed to read migration {raw_name}"),
                    err,
                )
            })?;
            migrations.push(Migration::from_file(&raw_name, bytes)?);
        }

        // Directory iteration order is platform-dependent.
        migrations.sort_by(|a, b| a.raw_name.cmp(&b.raw_name));

        Ok(FileSource { path, migrations })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    fn migrations(&self) -> Vec<Migration> {
        self.migrations.clone()
    }
}
