//! Shader source providers.
//!
//! Programs name their sources by virtual, forward-slash paths. A
//! [`SourceProvider`] resolves such a path to text and a modification time;
//! where the text actually lives is its own business.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use path_slash::PathBufExt as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("file not found '{0}'")]
    NotFound(String),

    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub trait SourceProvider {
    fn open_file(&self, path: &str) -> Result<String, SourceError>;
    fn modification_time(&self, path: &str) -> Result<SystemTime, SourceError>;
}

impl<T> SourceProvider for &T
where
    T: SourceProvider + ?Sized,
{
    fn open_file(&self, path: &str) -> Result<String, SourceError> {
        (*self).open_file(path)
    }

    fn modification_time(&self, path: &str) -> Result<SystemTime, SourceError> {
        (*self).modification_time(path)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    text: String,
    modified: SystemTime,
}

/// Sources held in memory.
///
/// Every mount or touch stamps the file with a time strictly later than
/// any stamp handed out before, even if the system clock has not moved.
#[derive(Debug, Clone)]
pub struct MemorySources {
    files: HashMap<String, MemoryFile>,
    last_stamp: SystemTime,
}

impl Default for MemorySources {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySources {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            last_stamp: SystemTime::UNIX_EPOCH,
        }
    }

    /// Add or replace the file at `path`.
    pub fn mount(&mut self, path: impl Into<String>, text: impl Into<String>) {
        let modified = self.next_stamp();
        self.files.insert(
            path.into(),
            MemoryFile {
                text: text.into(),
                modified,
            },
        );
    }

    pub fn unmount(&mut self, path: &str) -> bool {
        self.files.remove(path).is_some()
    }

    /// Advance the modification time of `path` without changing it.
    pub fn touch(&mut self, path: &str) -> bool {
        let stamp = self.next_stamp();
        match self.files.get_mut(path) {
            Some(file) => {
                file.modified = stamp;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn next_stamp(&mut self) -> SystemTime {
        let floor = self.last_stamp + Duration::from_nanos(1);
        self.last_stamp = SystemTime::now().max(floor);
        self.last_stamp
    }
}

impl SourceProvider for MemorySources {
    fn open_file(&self, path: &str) -> Result<String, SourceError> {
        self.files
            .get(path)
            .map(|file| file.text.clone())
            .ok_or_else(|| SourceError::NotFound(path.to_owned()))
    }

    fn modification_time(&self, path: &str) -> Result<SystemTime, SourceError> {
        self.files
            .get(path)
            .map(|file| file.modified)
            .ok_or_else(|| SourceError::NotFound(path.to_owned()))
    }
}

/// Sources read from a directory tree; virtual paths are relative to
/// `root`.
#[derive(Debug, Clone)]
pub struct DirectorySources {
    root: PathBuf,
}

impl DirectorySources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root
            .join(PathBuf::from_slash(path.trim_start_matches('/')))
    }

    fn map_io(path: &str, e: io::Error) -> SourceError {
        if e.kind() == io::ErrorKind::NotFound {
            SourceError::NotFound(path.to_owned())
        } else {
            SourceError::Io {
                path: path.to_owned(),
                source: e,
            }
        }
    }
}

impl SourceProvider for DirectorySources {
    fn open_file(&self, path: &str) -> Result<String, SourceError> {
        std::fs::read_to_string(self.resolve(path))
            .map_err(|e| Self::map_io(path, e))
    }

    fn modification_time(&self, path: &str) -> Result<SystemTime, SourceError> {
        std::fs::metadata(self.resolve(path))
            .and_then(|metadata| metadata.modified())
            .map_err(|e| Self::map_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stamps_strictly_increase() {
        let mut sources = MemorySources::new();
        sources.mount("a.vert", "void main() {}");
        let first = sources.modification_time("a.vert").unwrap();

        sources.mount("a.vert", "void main() { }");
        let second = sources.modification_time("a.vert").unwrap();
        assert!(second > first);

        assert!(sources.touch("a.vert"));
        assert!(sources.modification_time("a.vert").unwrap() > second);
        assert!(!sources.touch("missing.vert"));
    }

    #[test]
    fn unmounted_files_are_not_found() {
        let mut sources = MemorySources::new();
        sources.mount("shaders/flat.frag", "out vec4 color;");
        assert!(sources.unmount("shaders/flat.frag"));

        let err = sources.open_file("shaders/flat.frag").unwrap_err();
        assert_eq!(err.to_string(), "file not found 'shaders/flat.frag'");
        assert!(matches!(
            sources.modification_time("shaders/flat.frag"),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn directory_sources_read_relative_slash_paths() {
        let root = std::env::temp_dir().join(format!(
            "rgl-source-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join("nested").join("basic.vert"), "in vec3 position;")
            .unwrap();
        let sources = DirectorySources::new(&root);

        assert_eq!(
            sources.open_file("/nested/basic.vert").unwrap(),
            "in vec3 position;"
        );
        assert!(sources.modification_time("nested/basic.vert").is_ok());
        assert!(matches!(
            sources.open_file("nested/missing.vert"),
            Err(SourceError::NotFound(path)) if path == "nested/missing.vert"
        ));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
