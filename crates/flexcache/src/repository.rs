//! Materialized output repository
//!
//! Rendered resources may also be written to disk below a repository
//! directory, split into `online/` and `offline/`. Purging removes everything
//! below those two directories but keeps the directories themselves.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::Result;
use crate::request::Project;

/// Subdirectory of the repository holding a project's output
pub fn project_dir(project: Project) -> &'static str {
    match project {
        Project::Online => "online",
        Project::Offline => "offline",
    }
}

/// Delete the contents of both project directories, returning the number of
/// removed files and directories
///
/// Missing project directories are skipped. Entries that cannot be deleted
/// are logged and left in place.
pub fn purge(repository: &Path) -> Result<usize> {
    let mut removed = 0;
    for project in [Project::Online, Project::Offline] {
        let dir = repository.join(project_dir(project));
        removed += purge_directory(&dir)?;
    }
    Ok(removed)
}

fn purge_directory(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "nothing to purge");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        let result = if path.is_dir() {
            removed += purge_directory(&path)?;
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "could not delete file"),
        }
    }
    Ok(removed)
}
