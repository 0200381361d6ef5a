use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::errors::{IpcError, Result};

/// Readiness signal shared by every process attached to a logger.
///
/// A named pipe holds one byte per pending wakeup. It is opened read-write
/// and non-blocking, so any holder can both post and consume, and a reactor
/// can poll the descriptor for readability.
pub struct Readiness {
    fifo: File,
    path: PathBuf,
    owner: bool,
}

fn open_fifo(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
}

impl Readiness {
    pub fn create(path: &Path) -> Result<Readiness> {
        match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => {}
            Err(Errno::EEXIST) => {
                tracing::warn!(path = %path.display(), "reusing stale readiness fifo");
            }
            Err(e) => return Err(io::Error::from(e).into()),
        }
        let readiness = Readiness {
            fifo: open_fifo(path)?,
            path: path.to_path_buf(),
            owner: true,
        };
        readiness.drain()?;
        Ok(readiness)
    }

    pub fn open(path: &Path) -> Result<Readiness> {
        let fifo = open_fifo(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => IpcError::NotFound {
                name: path.display().to_string(),
            },
            io::ErrorKind::PermissionDenied => IpcError::PermissionDenied {
                name: path.display().to_string(),
            },
            _ => IpcError::Io(e),
        })?;
        Ok(Readiness {
            fifo,
            path: path.to_path_buf(),
            owner: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Posts one wakeup. A full pipe already signals readiness.
    pub fn notify(&self) -> Result<()> {
        match (&self.fifo).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Consumes every pending wakeup, returning how many there were.
    pub fn drain(&self) -> Result<usize> {
        let mut buf = [0u8; 64];
        let mut drained = 0;
        loop {
            match (&self.fifo).read(&mut buf) {
                Ok(0) => return Ok(drained),
                Ok(n) => drained += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Re-arms the pipe to match the queue: drained first, then one byte
    /// posted back if work is still pending, so a concurrent post is never lost.
    pub fn settle<F>(&self, pending: F) -> Result<()>
    where
        F: FnOnce() -> Result<bool>,
    {
        self.drain()?;
        if pending()? {
            self.notify()?;
        }
        Ok(())
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fifo.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fifo.as_raw_fd()
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove readiness fifo");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_and_drain_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.fifo");
        let owner = Readiness::create(&path).unwrap();
        let peer = Readiness::open(&path).unwrap();
        assert!(owner.raw_fd() >= 0);

        for _ in 0..3 {
            peer.notify().unwrap();
        }
        assert_eq!(owner.drain().unwrap(), 3);
        assert_eq!(peer.drain().unwrap(), 0);
    }

    #[test]
    fn settle_keeps_one_byte_while_pending() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Readiness::create(&dir.path().join("settle.fifo")).unwrap();
        owner.notify().unwrap();
        owner.notify().unwrap();
        owner.settle(|| Ok(true)).unwrap();
        assert_eq!(owner.drain().unwrap(), 1);
        owner.notify().unwrap();
        owner.settle(|| Ok(false)).unwrap();
        assert_eq!(owner.drain().unwrap(), 0);
    }

    #[test]
    fn owner_removes_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.fifo");
        let owner = Readiness::create(&path).unwrap();
        assert!(path.exists());
        drop(owner);
        assert!(!path.exists());
        assert!(matches!(Readiness::open(&path), Err(IpcError::NotFound { .. })));
    }
}
