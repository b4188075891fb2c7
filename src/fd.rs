//! Device number lookup for a file descriptor of the calling process.
use crate::dev::Dev;
use std::ffi::c_uint;

/// The parts of `struct inode` the hook looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub rdev: Dev,
}

/// A referenced open file, as handed out by [`FdTable::fdget`].
///
/// `handle` is whatever the kernel side needs to drop the reference again.
#[derive(Debug)]
pub struct FileRef {
    handle: usize,
    inode: Option<Inode>,
}

impl FileRef {
    pub fn new(handle: usize, inode: Option<Inode>) -> Self {
        Self { handle, inode }
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    pub fn inode(&self) -> Option<&Inode> {
        self.inode.as_ref()
    }
}

/// The calling process's file descriptor table.
pub trait FdTable {
    /// `fdget`, must neither block nor sleep. A returned file holds a reference that is
    /// released by exactly one [`FdTable::fdput`].
    fn fdget(&self, fd: c_uint) -> Option<FileRef>;

    fn fdput(&self, file: FileRef);
}

/// Holds a reference taken by `fdget` and gives it back on drop.
struct FdGuard<'t, T: FdTable + ?Sized> {
    table: &'t T,
    file: Option<FileRef>,
}

impl<'t, T: FdTable + ?Sized> FdGuard<'t, T> {
    fn get(table: &'t T, fd: c_uint) -> Option<Self> {
        let file = table.fdget(fd)?;
        Some(Self {
            table,
            file: Some(file),
        })
    }

    fn file(&self) -> Option<&FileRef> {
        self.file.as_ref()
    }
}

impl<T: FdTable + ?Sized> Drop for FdGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.table.fdput(file);
        }
    }
}

/// The device behind `fd`, or [`Dev::UNKNOWN`] if there is no such file or it has no inode.
pub fn rdev<T: FdTable + ?Sized>(table: &T, fd: c_uint) -> Dev {
    let Some(guard) = FdGuard::get(table, fd) else {
        return Dev::UNKNOWN;
    };

    guard
        .file()
        .and_then(FileRef::inode)
        .map_or(Dev::UNKNOWN, |inode| inode.rdev)
}
