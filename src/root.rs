//! Rooted filesystem handle. Every backing-file operation the server
//! performs goes through [`RootDir`], which joins untrusted names onto the
//! configured base directory and refuses anything that would escape it.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File};

#[derive(Clone, Debug)]
pub struct RootDir {
    base: PathBuf,
}

impl RootDir {
    /// Opens `base` as the served directory. The path must already exist
    /// and be a directory.
    pub fn open(base: impl AsRef<Path>) -> io::Result<RootDir> {
        let base = base.as_ref().canonicalize()?;
        if !base.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", base.display()),
            ));
        }
        Ok(RootDir { base })
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    /// Maps a wire filename to a path inside the root. Leading slashes are
    /// stripped, so clients that request `/x` and `x` get the same file;
    /// `..` and other non-normal components are refused.
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("{name} escapes the served directory"),
                    ));
                }
            }
        }
        Ok(self.base.join(relative))
    }

    pub async fn open_file(&self, name: &str) -> io::Result<File> {
        File::open(self.resolve(name)?).await
    }

    pub async fn create_file(&self, name: &str) -> io::Result<File> {
        File::create(self.resolve(name)?).await
    }

    pub async fn remove_file(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(name)?).await
    }
}
