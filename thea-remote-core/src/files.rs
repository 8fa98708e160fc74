use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::*;

use thea_remote_protocol::{FileEntry, FileResponse};

const CRITICAL_PATHS: &[&str] = &[
    "/", "/Users", "/System", "/Library", "/Applications", "/bin", "/sbin", "/usr",
];

/// Minimum component depth a delete target must have when it lives under
/// a critical root: `/Users/alice` is protected, `/Users/alice/file` is
/// fair game.
const MIN_DELETE_DEPTH: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum FileServiceError {
    #[error("Path traversal attack detected")]
    Traversal,
    #[error("Invalid path")]
    InvalidPath,
    #[error("Access to this path is blocked")]
    Blocked,
    #[error("Path is outside the allowed directories")]
    NotAllowed,
    #[error("Deleting this path is not permitted")]
    CriticalPath,
    #[error("File not found")]
    NotFound,
    #[error("File already exists")]
    AlreadyExists,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Not a file")]
    NotAFile,
    #[error("File too large ({0} bytes)")]
    TooLarge(u64),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl FileServiceError {
    /// Policy rejections audit as denied/blocked; everything else is a
    /// runtime failure.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            FileServiceError::Traversal
                | FileServiceError::InvalidPath
                | FileServiceError::Blocked
                | FileServiceError::NotAllowed
                | FileServiceError::CriticalPath
                | FileServiceError::TooLarge(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOperation {
    Read,
    Write,
    Delete,
}

pub struct FileService {
    allowed_paths: Vec<PathBuf>,
    blocked_paths: Vec<PathBuf>,
    max_transfer_size: u64,
}

impl FileService {
    pub fn new(
        allowed_paths: Vec<PathBuf>,
        blocked_paths: Vec<PathBuf>,
        max_transfer_size: u64,
    ) -> Self {
        Self {
            allowed_paths,
            blocked_paths,
            max_transfer_size,
        }
    }

    /// Central gate for every path-taking operation.
    ///
    /// Expands `~`, canonicalizes, rejects lexical traversal and NUL
    /// bytes, then applies blocked (first) and allowed prefix lists.
    /// Deletes additionally refuse critical system roots and anything
    /// shallower than three components under them.
    pub fn validate_and_resolve_path(
        &self,
        input: &str,
        operation: PathOperation,
    ) -> Result<PathBuf, FileServiceError> {
        if input.is_empty() || input.contains('\0') {
            return Err(FileServiceError::InvalidPath);
        }
        // Lexical `..` is rejected before any resolution happens
        if Path::new(input)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FileServiceError::Traversal);
        }

        let expanded = expand_tilde(input)?;
        let resolved = canonicalize_lenient(&expanded)?;

        for blocked in &self.blocked_paths {
            if resolved.starts_with(blocked) {
                return Err(FileServiceError::Blocked);
            }
        }
        if !self.allowed_paths.is_empty()
            && !self.allowed_paths.iter().any(|a| resolved.starts_with(a))
        {
            return Err(FileServiceError::NotAllowed);
        }

        if operation == PathOperation::Delete {
            let depth = resolved
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count();
            for critical in CRITICAL_PATHS {
                let critical = Path::new(critical);
                if resolved == critical
                    || (resolved.starts_with(critical) && depth < MIN_DELETE_DEPTH)
                {
                    return Err(FileServiceError::CriticalPath);
                }
            }
        }

        Ok(resolved)
    }

    /// Sorted case-insensitively; hidden entries filtered unless asked for.
    pub async fn list(
        &self,
        path: &str,
        recursive: bool,
        show_hidden: bool,
    ) -> Result<Vec<FileEntry>, FileServiceError> {
        let root = self.validate_and_resolve_path(path, PathOperation::Read)?;
        let mut entries = vec![];
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .map_err(map_not_found)?;
            while let Some(entry) = read_dir.next_entry().await? {
                let file_entry = entry_from_path(&entry.path()).await?;
                if file_entry.is_hidden && !show_hidden {
                    continue;
                }
                if recursive && file_entry.is_directory {
                    pending.push(entry.path());
                }
                entries.push(file_entry);
            }
        }
        entries.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(entries)
    }

    pub async fn info(&self, path: &str) -> Result<FileEntry, FileServiceError> {
        let resolved = self.validate_and_resolve_path(path, PathOperation::Read)?;
        if !resolved.exists() {
            return Err(FileServiceError::NotFound);
        }
        entry_from_path(&resolved).await
    }

    /// Reads at most `length` bytes from `offset`. `is_complete` is true
    /// iff the read reached EOF; a read at or past EOF yields empty data
    /// and `is_complete = true`.
    pub async fn read(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<FileResponse, FileServiceError> {
        let resolved = self.validate_and_resolve_path(path, PathOperation::Read)?;
        let mut file = tokio::fs::File::open(&resolved).await.map_err(map_not_found)?;
        let size = file.metadata().await?.len();
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = Vec::with_capacity(length.min(1 << 20) as usize);
        file.take(length).read_to_end(&mut data).await?;
        let read = data.len() as u64;
        Ok(FileResponse::Data {
            data: data.into(),
            offset,
            is_complete: offset + read >= size,
        })
    }

    pub async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        append: bool,
    ) -> Result<FileResponse, FileServiceError> {
        let resolved = self.validate_and_resolve_path(path, PathOperation::Write)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        }
        let mut file = options.open(&resolved).await?;
        if !append {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        file.write_all(data).await?;
        file.flush().await?;
        Ok(FileResponse::Success(format!(
            "Wrote {} bytes to {}",
            data.len(),
            resolved.display()
        )))
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<FileResponse, FileServiceError> {
        let resolved = self.validate_and_resolve_path(path, PathOperation::Delete)?;
        let metadata = tokio::fs::symlink_metadata(&resolved)
            .await
            .map_err(map_not_found)?;
        if metadata.is_dir() {
            let mut read_dir = tokio::fs::read_dir(&resolved).await?;
            let empty = read_dir.next_entry().await?.is_none();
            if !empty && !recursive {
                return Err(FileServiceError::NotEmpty);
            }
            if recursive {
                tokio::fs::remove_dir_all(&resolved).await?;
            } else {
                tokio::fs::remove_dir(&resolved).await?;
            }
        } else {
            tokio::fs::remove_file(&resolved).await?;
        }
        Ok(FileResponse::Success(format!(
            "Deleted {}",
            resolved.display()
        )))
    }

    pub async fn move_entry(&self, from: &str, to: &str) -> Result<FileResponse, FileServiceError> {
        let source = self.validate_and_resolve_path(from, PathOperation::Write)?;
        let target = self.validate_and_resolve_path(to, PathOperation::Write)?;
        if !source.exists() {
            return Err(FileServiceError::NotFound);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(FileResponse::Success(format!(
            "Moved to {}",
            target.display()
        )))
    }

    pub async fn copy_entry(&self, from: &str, to: &str) -> Result<FileResponse, FileServiceError> {
        let source = self.validate_and_resolve_path(from, PathOperation::Read)?;
        let target = self.validate_and_resolve_path(to, PathOperation::Write)?;
        if !source.exists() {
            return Err(FileServiceError::NotFound);
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &target).await?;
        Ok(FileResponse::Success(format!(
            "Copied to {}",
            target.display()
        )))
    }

    pub async fn download(&self, path: &str) -> Result<FileResponse, FileServiceError> {
        let resolved = self.validate_and_resolve_path(path, PathOperation::Read)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(map_not_found)?;
        if metadata.is_dir() {
            return Err(FileServiceError::NotAFile);
        }
        if metadata.len() > self.max_transfer_size {
            return Err(FileServiceError::TooLarge(metadata.len()));
        }
        let data = tokio::fs::read(&resolved).await?;
        let is_complete = true;
        Ok(FileResponse::Data {
            data: data.into(),
            offset: 0,
            is_complete,
        })
    }

    pub async fn upload(
        &self,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<FileResponse, FileServiceError> {
        if data.len() as u64 > self.max_transfer_size {
            return Err(FileServiceError::TooLarge(data.len() as u64));
        }
        let resolved = self.validate_and_resolve_path(path, PathOperation::Write)?;
        if resolved.exists() && !overwrite {
            return Err(FileServiceError::AlreadyExists);
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, data).await?;
        Ok(FileResponse::Success(format!(
            "Uploaded {} bytes to {}",
            data.len(),
            resolved.display()
        )))
    }
}

fn map_not_found(error: std::io::Error) -> FileServiceError {
    if error.kind() == std::io::ErrorKind::NotFound {
        FileServiceError::NotFound
    } else {
        FileServiceError::Io(error)
    }
}

fn expand_tilde(input: &str) -> Result<PathBuf, FileServiceError> {
    if input == "~" || input.starts_with("~/") {
        let home = std::env::var_os("HOME").ok_or(FileServiceError::InvalidPath)?;
        let mut path = PathBuf::from(home);
        if input.len() > 2 {
            path.push(&input[2..]);
        }
        return Ok(path);
    }
    if input.starts_with('~') {
        // `~otheruser` expansion is not supported
        return Err(FileServiceError::InvalidPath);
    }
    Ok(PathBuf::from(input))
}

/// Canonicalizes the longest existing ancestor and reattaches the rest,
/// so paths that do not exist yet (write/upload targets) still resolve.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf, FileServiceError> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }
    let mut existing = path;
    let mut tail = vec![];
    loop {
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name.to_owned());
                }
                if let Ok(resolved) = parent.canonicalize() {
                    let mut result = resolved;
                    for part in tail.iter().rev() {
                        result.push(part);
                    }
                    return Ok(result);
                }
                existing = parent;
            }
            None => return Err(FileServiceError::InvalidPath),
        }
    }
}

async fn entry_from_path(path: &Path) -> Result<FileEntry, FileServiceError> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let symlink_target = if metadata.file_type().is_symlink() {
        tokio::fs::read_link(path).await.ok()
    } else {
        None
    };
    Ok(FileEntry {
        is_hidden: name.starts_with('.'),
        is_directory: metadata.is_dir(),
        size: metadata.len(),
        created: system_time_to_utc(metadata.created().ok()),
        modified: system_time_to_utc(metadata.modified().ok()),
        permissions: permission_triple(&metadata),
        symlink_target,
        path: path.to_path_buf(),
        name,
    })
}

fn system_time_to_utc(time: Option<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.map(DateTime::<Utc>::from)
}

#[cfg(unix)]
fn permission_triple(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode();
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn permission_triple(metadata: &std::fs::Metadata) -> String {
    if metadata.permissions().readonly() {
        "r--r--r--".to_owned()
    } else {
        "rw-rw-rw-".to_owned()
    }
}
