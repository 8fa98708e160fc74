use std::io::{self, Write};
use std::path::Path;

/// Everything the server persists is private to the owning user: key
/// material, audit logs, recordings, the secret store.
const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

pub fn secure_directory<P: AsRef<Path>>(path: P) -> io::Result<()> {
    restrict_mode(path.as_ref(), DIR_MODE)
}

pub fn secure_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    restrict_mode(path.as_ref(), FILE_MODE)
}

/// Writes `data` through a sibling temp file and renames it into place,
/// so readers never observe a half-written audit log or index. The temp
/// file is created owner-only; the mode travels with the rename.
pub fn atomic_write<P: AsRef<Path>>(path: P, data: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(FILE_MODE);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.flush()?;
    drop(file);

    std::fs::rename(&tmp, path)
}
