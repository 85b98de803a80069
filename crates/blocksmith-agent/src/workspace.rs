use anyhow::{Result, anyhow};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// What the session may read and mutate. Paths are workspace-relative strings
/// exactly as they appear in edit blocks.
pub trait FileOracle {
    fn root(&self) -> &Path;

    fn is_editable(&self, path: &str) -> bool;

    /// Make `path` editable. Returns `false` when the path can never be edited.
    fn request_promote(&mut self, path: &str) -> bool;

    /// `Ok(None)` when the file does not exist.
    fn read_content(&self, path: &str) -> io::Result<Option<String>>;

    fn write_content(&mut self, path: &str, content: &str) -> io::Result<()>;

    fn editable_files(&self) -> Vec<String>;

    fn read_only_files(&self) -> Vec<String>;

    /// Fails when storage is unusable for the whole workspace.
    fn check_available(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute paths are forbidden: {0}")]
    Absolute(String),
    #[error("path escapes the workspace: {0}")]
    Traversal(String),
    #[error(".git mutation forbidden: {0}")]
    GitDir(String),
}

impl From<PathError> for io::Error {
    fn from(err: PathError) -> Self {
        io::Error::new(io::ErrorKind::PermissionDenied, err)
    }
}

/// Normalize a workspace-relative path, rejecting anything that could leave
/// the workspace or touch `.git`.
pub fn normalize_relative(path: &str) -> Result<String, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                if part == ".git" {
                    return Err(PathError::GitDir(trimmed.to_string()));
                }
                parts.push(part.into_owned());
            }
            Component::ParentDir => return Err(PathError::Traversal(trimmed.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(trimmed.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

/// Files on disk under a workspace root, split into editable and read-only sets.
#[derive(Debug, Clone)]
pub struct WorkspaceFiles {
    root: PathBuf,
    editable: BTreeSet<String>,
    read_only: BTreeSet<String>,
}

impl WorkspaceFiles {
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("workspace root {} is not a directory", root.display()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            editable: BTreeSet::new(),
            read_only: BTreeSet::new(),
        })
    }

    pub fn add_editable(&mut self, path: &str) -> Result<()> {
        let rel = normalize_relative(path)?;
        self.read_only.remove(&rel);
        self.editable.insert(rel);
        Ok(())
    }

    pub fn add_read_only(&mut self, path: &str) -> Result<()> {
        let rel = normalize_relative(path)?;
        if !self.editable.contains(&rel) {
            self.read_only.insert(rel);
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(normalize_relative(path)?))
    }
}

impl FileOracle for WorkspaceFiles {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_editable(&self, path: &str) -> bool {
        normalize_relative(path).is_ok_and(|rel| self.editable.contains(&rel))
    }

    fn request_promote(&mut self, path: &str) -> bool {
        self.add_editable(path).is_ok()
    }

    fn read_content(&self, path: &str) -> io::Result<Option<String>> {
        let full = self.resolve(path)?;
        match fs::read_to_string(&full) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_content(&mut self, path: &str, content: &str) -> io::Result<()> {
        if !self.is_editable(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{path} is not editable"),
            ));
        }
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, content)
    }

    fn editable_files(&self) -> Vec<String> {
        self.editable.iter().cloned().collect()
    }

    fn read_only_files(&self) -> Vec<String> {
        self.read_only.iter().cloned().collect()
    }

    fn check_available(&self) -> io::Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("workspace root {} is no longer available", self.root.display()),
            ))
        }
    }
}
