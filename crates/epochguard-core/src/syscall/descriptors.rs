//! Descriptor numbering that survives rollback.
//!
//! Closing a descriptor must free its number so the next open gets the
//! same number the kernel would give it, yet the open file description has
//! to stay alive in case the epoch rolls back. A close therefore moves the
//! description to a shelter (a descriptor at or above [`SHELTER_BASE`]) and
//! releases the program's number. Shelters are really closed at commit.
//!
//! On rollback, files opened during the epoch are moved into shelters and
//! files closed during it are put back at their original numbers. Replay
//! of an open then reinstalls the sheltered description at the recorded
//! number instead of opening anything.

#![allow(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backend::SyscallBackend;
use super::shadow::{ForeignShadow, ShadowCopy};
use super::{Errno, SysResult};

/// Lowest descriptor number used for shelters.
pub const SHELTER_BASE: i32 = 1000;

/// What the program holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Fd(i32),
    Stream(usize),
    Dir(usize),
}

impl FileKind {
    fn shadow(self) -> Option<(usize, ForeignShadow)> {
        match self {
            Self::Fd(_) => None,
            Self::Stream(f) => Some((f, ForeignShadow::STREAM)),
            Self::Dir(d) => Some((d, ForeignShadow::DIRECTORY)),
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    kind: FileKind,
    /// Number the program knows.
    fd: i32,
    opened_in_epoch: bool,
    /// Closed by the program during this epoch.
    closed: bool,
    /// Sheltered and waiting for a replayed open.
    awaiting_reopen: bool,
    shelter: Option<i32>,
    /// File offset (or directory position) at the last commit or open.
    position: Option<i64>,
    shadow: Option<ShadowCopy>,
}

pub struct DescriptorTable {
    backend: Arc<dyn SyscallBackend>,
    files: Mutex<Vec<OpenFile>>,
}

impl DescriptorTable {
    #[must_use]
    pub fn new(backend: Arc<dyn SyscallBackend>) -> Self {
        Self {
            backend,
            files: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self, file: &mut OpenFile) {
        file.position = match file.kind {
            FileKind::Dir(d) => Some(self.backend.telldir(d)),
            _ => self.backend.lseek(file.fd, 0, libc::SEEK_CUR).ok(),
        };
        file.shadow = file.kind.shadow().map(|(addr, layout)| {
            // SAFETY: the stream is open, so the runtime's allocation is live.
            unsafe { layout.capture(addr) }
        });
    }

    fn restore(&self, file: &OpenFile) {
        if let Some(shadow) = &file.shadow {
            // SAFETY: streams are never freed before commit.
            unsafe { shadow.restore() };
        }
        match (file.kind, file.position) {
            (FileKind::Dir(d), Some(pos)) => self.backend.seekdir(d, pos),
            (_, Some(pos)) => {
                if let Err(e) = self.backend.lseek(file.fd, pos, libc::SEEK_SET) {
                    warn!(fd = file.fd, errno = e.0, "file position not restored");
                }
            }
            _ => {}
        }
    }

    /// Move `file`'s description out of the program's number.
    fn shelter(&self, file: &mut OpenFile) -> SysResult<()> {
        if let FileKind::Stream(f) = file.kind {
            self.backend.fflush(f)?;
        }
        let high = self.backend.dup_at_least(file.fd, SHELTER_BASE)?;
        self.backend.close(file.fd)?;
        if let Some((addr, layout)) = file.kind.shadow() {
            // SAFETY: the stream stays allocated until commit closes it.
            unsafe { layout.set_fd(addr, high) };
        }
        file.shelter = Some(high);
        Ok(())
    }

    /// Put a sheltered description back at its program number.
    fn unshelter(&self, file: &mut OpenFile) -> SysResult<()> {
        let Some(high) = file.shelter.take() else {
            return Ok(());
        };
        self.backend.dup2(high, file.fd)?;
        self.backend.close(high)?;
        // Also puts the program's number back into a stream's descriptor field.
        self.restore(file);
        Ok(())
    }

    /// A successful open during normal execution.
    pub fn opened(&self, kind: FileKind, fd: i32) {
        let mut file = OpenFile {
            kind,
            fd,
            opened_in_epoch: true,
            closed: false,
            awaiting_reopen: false,
            shelter: None,
            position: None,
            shadow: None,
        };
        self.snapshot(&mut file);
        self.files.lock().push(file);
    }

    /// Close `kind` for the program. The description is sheltered, not
    /// closed. Unknown plain descriptors are adopted first.
    pub fn close(&self, kind: FileKind) -> SysResult<()> {
        let mut files = self.files.lock();
        let live = files
            .iter()
            .position(|f| !f.closed && !f.awaiting_reopen && f.kind == kind);
        let at = match (live, kind) {
            (Some(at), _) => at,
            (None, FileKind::Fd(fd)) => {
                // Opened before we were watching; it predates the epoch.
                // The seek rejects numbers that are not open at all.
                if let Err(e) = self.backend.lseek(fd, 0, libc::SEEK_CUR) {
                    if e != Errno(libc::ESPIPE) {
                        return Err(e);
                    }
                }
                let mut file = OpenFile {
                    kind,
                    fd,
                    opened_in_epoch: false,
                    closed: false,
                    awaiting_reopen: false,
                    shelter: None,
                    position: None,
                    shadow: None,
                };
                self.snapshot(&mut file);
                files.push(file);
                files.len() - 1
            }
            (None, _) => return Err(Errno::EBADF),
        };
        let file = &mut files[at];
        self.shelter(file)?;
        file.closed = true;
        Ok(())
    }

    /// Descriptor number the program associates with a stream.
    #[must_use]
    pub fn program_fd(&self, kind: FileKind) -> Option<i32> {
        self.files
            .lock()
            .iter()
            .find(|f| f.kind == kind && !f.closed)
            .map(|f| f.fd)
    }

    /// Replay of an open that returned `kind` at `fd`.
    pub fn reinstall(&self, kind: FileKind) -> SysResult<()> {
        let mut files = self.files.lock();
        let Some(file) = files.iter_mut().find(|f| f.awaiting_reopen && f.kind == kind) else {
            return Err(Errno::EBADF);
        };
        self.unshelter(file)?;
        file.awaiting_reopen = false;
        file.closed = false;
        Ok(())
    }

    /// Commit: close every shelter and take new positions.
    pub fn commit(&self) {
        let mut files = self.files.lock();
        let mut closed = 0usize;
        for file in files.iter().filter(|f| f.closed) {
            let rc = match (file.kind, file.shelter) {
                (FileKind::Stream(f), _) => self.backend.fclose(f),
                (FileKind::Dir(d), _) => self.backend.closedir(d),
                (FileKind::Fd(_), Some(high)) => self.backend.close(high),
                (FileKind::Fd(_), None) => Ok(()),
            };
            if let Err(e) = rc {
                warn!(fd = file.fd, errno = e.0, "deferred close failed");
            }
            closed += 1;
        }
        files.retain(|f| !f.closed);
        for file in files.iter_mut() {
            if let FileKind::Stream(f) = file.kind {
                let _ = self.backend.fflush(f);
            }
            file.opened_in_epoch = false;
            self.snapshot(file);
        }
        if closed > 0 {
            debug!(closed, open = files.len(), "deferred closes committed");
        }
    }

    /// Return every tracked file to its state at the last commit.
    ///
    /// Files opened during the epoch end up sheltered; those that existed
    /// before it are back at their numbers and positions.
    pub fn prepare_rollback(&self) -> SysResult<()> {
        let mut files = self.files.lock();
        for file in files.iter_mut().filter(|f| f.opened_in_epoch) {
            if file.shelter.is_none() {
                self.shelter(file)?;
            }
            file.closed = true;
            file.awaiting_reopen = true;
        }
        for file in files.iter_mut().filter(|f| !f.opened_in_epoch) {
            if file.closed {
                self.unshelter(file)?;
                file.closed = false;
            } else {
                self.restore(file);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.files.lock().iter().filter(|f| !f.closed).count()
    }

    #[must_use]
    pub fn sheltered_count(&self) -> usize {
        self.files.lock().iter().filter(|f| f.shelter.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::LibcBackend;
    use std::ffi::CString;

    fn open(b: &LibcBackend, dir: &std::path::Path, name: &str) -> i32 {
        let path = CString::new(dir.join(name).to_str().unwrap()).unwrap();
        b.open(&path, libc::O_CREAT | libc::O_RDWR, 0o600).unwrap()
    }

    #[test]
    fn close_frees_the_number_and_commit_closes_the_shelter() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LibcBackend;
        let table = DescriptorTable::new(Arc::new(LibcBackend));
        let a = open(&backend, dir.path(), "a");
        table.opened(FileKind::Fd(a), a);
        table.close(FileKind::Fd(a)).unwrap();
        assert_eq!(table.sheltered_count(), 1);
        let again = open(&backend, dir.path(), "b");
        table.opened(FileKind::Fd(again), again);
        table.commit();
        assert_eq!(table.sheltered_count(), 0);
        assert_eq!(table.open_count(), 1);
        backend.close(again).unwrap();
    }

    #[test]
    fn rollback_restores_a_pre_epoch_file_and_its_offset() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LibcBackend;
        let table = DescriptorTable::new(Arc::new(LibcBackend));
        let fd = open(&backend, dir.path(), "log");
        backend.write(fd, b"0123456789").unwrap();
        table.opened(FileKind::Fd(fd), fd);
        table.commit();

        backend.write(fd, b"abc").unwrap();
        table.close(FileKind::Fd(fd)).unwrap();
        assert_eq!(backend.lseek(fd, 0, libc::SEEK_CUR), Err(Errno::EBADF));

        table.prepare_rollback().unwrap();
        assert_eq!(backend.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 10);
        assert_eq!(table.sheltered_count(), 0);
        backend.close(fd).unwrap();
    }
}
