//! Destination files that appear only once complete.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Output staged in a hidden file next to the destination.
///
/// [`commit`](AtomicDestination::commit) renames it over the destination;
/// dropping it uncommitted removes it.
#[derive(Debug)]
pub struct AtomicDestination {
    file: File,
    staged: TempPath,
    target: PathBuf,
}

impl AtomicDestination {
    pub fn create(target: &Path) -> io::Result<Self> {
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let name = target
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("destination {} has no file name", target.display()),
                )
            })?
            .to_string_lossy();
        let (file, staged) = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".part")
            .tempfile_in(dir)?
            .into_parts();
        Ok(Self {
            file: File::from_std(file),
            staged,
            target: target.to_path_buf(),
        })
    }

    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush and move the staged file into place.
    pub async fn commit(self) -> io::Result<PathBuf> {
        let AtomicDestination {
            mut file,
            staged,
            target,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        staged.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }
}

/// Whether `a` and `b` name the same file, following links.
///
/// A path that does not exist matches nothing.
pub fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    let (meta_a, meta_b) = match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(meta_a), Ok(meta_b)) => (meta_a, meta_b),
        (Err(err), _) | (_, Err(err)) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(false)
        }
        (Err(err), _) | (_, Err(err)) => return Err(err),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok(meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = (meta_a, meta_b);
        Ok(std::fs::canonicalize(a)? == std::fs::canonicalize(b)?)
    }
}
