//! Migration sources: where `.sql` files come from.
//!
//! A source only lists entries and reads files. Filtering, ordering and
//! naming checks happen in [`discover_migrations`](super::file::discover_migrations)
//! so every source behaves identically.

use include_dir::{Dir, DirEntry};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Sockets, devices, dangling symlinks.
    Other,
}

/// One entry directly under the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl SourceEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
        }
    }
}

/// Read-only handle to a collection of migration files.
pub trait MigrationSource {
    /// Human-readable location for logs and errors.
    fn location(&self) -> String;

    /// List the entries directly under the source root, in any order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the location itself cannot be listed.
    fn entries(&self) -> io::Result<Vec<SourceEntry>>;

    /// Read one file's SQL.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file is missing or not UTF-8.
    fn read(&self, filename: &str) -> io::Result<String>;
}

/// Migrations in a directory on disk.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MigrationSource for DirectorySource {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    log::warn!("Skipping non UTF-8 entry {:?} in {}", raw, self.root.display());
                    continue;
                }
            };
            // Follow symlinks so a linked file counts as a regular file
            let kind = match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => EntryKind::File,
                Ok(meta) if meta.is_dir() => EntryKind::Directory,
                _ => EntryKind::Other,
            };
            entries.push(SourceEntry { name, kind });
        }
        Ok(entries)
    }

    fn read(&self, filename: &str) -> io::Result<String> {
        fs::read_to_string(self.root.join(filename))
    }
}

/// Migrations compiled into the binary with `include_dir!`.
///
/// ```rust,ignore
/// use include_dir::{include_dir, Dir};
/// use tidemark::EmbeddedSource;
///
/// static ASSETS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/db");
///
/// let source = EmbeddedSource::new(&ASSETS).with_subdir("migrations");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedSource {
    dir: &'static Dir<'static>,
    subdir: Option<&'static str>,
}

impl EmbeddedSource {
    pub fn new(dir: &'static Dir<'static>) -> Self {
        Self { dir, subdir: None }
    }

    /// Read migrations from a sub-directory of the embedded tree.
    pub fn with_subdir(mut self, subdir: &'static str) -> Self {
        self.subdir = Some(subdir);
        self
    }

    fn root(&self) -> io::Result<&'static Dir<'static>> {
        match self.subdir {
            None => Ok(self.dir),
            Some(sub) => self.dir.get_dir(sub).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("embedded directory '{sub}' not found"),
                )
            }),
        }
    }
}

fn entry_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

impl MigrationSource for EmbeddedSource {
    fn location(&self) -> String {
        match self.subdir {
            Some(sub) => format!("embedded:{sub}"),
            None => "embedded:/".to_string(),
        }
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        let root = self.root()?;
        Ok(root
            .entries()
            .iter()
            .filter_map(|entry| match entry {
                DirEntry::File(file) => entry_name(file.path()).map(SourceEntry::file),
                DirEntry::Dir(dir) => entry_name(dir.path()).map(SourceEntry::directory),
            })
            .collect())
    }

    fn read(&self, filename: &str) -> io::Result<String> {
        let root = self.root()?;
        let file = root
            .files()
            .find(|f| entry_name(f.path()).as_deref() == Some(filename))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("embedded file '{filename}' not found"),
                )
            })?;
        file.contents_utf8().map(str::to_string).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("embedded file '{filename}' is not UTF-8"),
            )
        })
    }
}

/// Migrations held in memory, e.g. a table of `include_str!` pairs.
///
/// ```rust
/// use tidemark::MemorySource;
///
/// static MIGRATIONS: &[(&str, &str)] = &[
///     ("001_create_users.sql", "CREATE TABLE users (id BIGINT PRIMARY KEY);"),
///     ("002_add_email.sql", "ALTER TABLE users ADD COLUMN email TEXT;"),
/// ];
///
/// let source = MemorySource::from_static(MIGRATIONS);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<(String, String)>,
    directories: Vec<String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_static(files: &[(&str, &str)]) -> Self {
        files
            .iter()
            .fold(Self::new(), |source, (name, sql)| source.with_file(*name, *sql))
    }

    pub fn with_file(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.files.push((name.into(), sql.into()));
        self
    }

    pub fn with_directory(mut self, name: impl Into<String>) -> Self {
        self.directories.push(name.into());
        self
    }
}

impl MigrationSource for MemorySource {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn entries(&self) -> io::Result<Vec<SourceEntry>> {
        Ok(self
            .files
            .iter()
            .map(|(name, _)| SourceEntry::file(name.clone()))
            .chain(self.directories.iter().map(|d| SourceEntry::directory(d.clone())))
            .collect())
    }

    fn read(&self, filename: &str) -> io::Result<String> {
        self.files
            .iter()
            .find(|(name, _)| name == filename)
            .map(|(_, sql)| sql.clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("'{filename}' not found"))
            })
    }
}
