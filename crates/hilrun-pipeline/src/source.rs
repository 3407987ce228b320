//! Firmware source discovery.

use std::io;
use std::path::{Path, PathBuf};

/// Extensions the cross-compiler accepts directly.
pub const SOURCE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "s", "S"];

/// A firmware source tree: a single file or a directory of sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTree {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl SourceTree {
    /// Collect compilable files under `path` in sorted order.
    ///
    /// Hidden directories and directories named `build` are skipped, as is
    /// anything under `exclude` (normally the run's build directory).
    pub fn discover(path: &Path, exclude: Option<&Path>) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.is_file() {
            let root = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let files = if is_source(path) {
                vec![path.to_path_buf()]
            } else {
                Vec::new()
            };
            return Ok(Self { root, files });
        }

        let mut files = Vec::new();
        walk(path, exclude, &mut files)?;
        files.sort();
        Ok(Self {
            root: path.to_path_buf(),
            files,
        })
    }

    /// Directory the compiler runs in and `{source_dir}` expands to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

fn walk(dir: &Path, exclude: Option<&Path>, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if exclude.is_some_and(|ex| path.starts_with(ex)) {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_dir() {
            if name.starts_with('.') || name == "build" {
                continue;
            }
            walk(&path, exclude, out)?;
        } else if is_source(&path) {
            out.push(path);
        }
    }
    Ok(())
}
