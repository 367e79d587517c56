//! Glob masks over file names in the watched directory.

use std::path::{Path, PathBuf};

use super::TailerError;

/// A set of glob masks matched against bare file names.
#[derive(Debug, Clone)]
pub struct MaskSet {
    patterns: Vec<glob::Pattern>,
}

impl MaskSet {
    /// Compile the given masks.
    ///
    /// # Errors
    ///
    /// Returns [`TailerError::InvalidMask`] for the first mask that is not a
    /// valid glob.
    pub fn new<S: AsRef<str>>(masks: &[S]) -> Result<Self, TailerError> {
        let patterns = masks
            .iter()
            .map(|mask| {
                let mask = mask.as_ref();
                glob::Pattern::new(mask).map_err(|source| TailerError::InvalidMask {
                    mask: mask.to_owned(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether the file name of `path` matches any mask.
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.patterns.iter().any(|p| p.matches(name)))
    }

    /// List the regular files directly under `dir` that match a mask,
    /// sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_matching(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let path = entry.path();
            if is_file && self.matches(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
