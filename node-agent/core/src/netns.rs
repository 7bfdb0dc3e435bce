use std::{
    fmt,
    fs::File,
    io,
    os::{
        fd::{AsFd, BorrowedFd},
        unix::fs::MetadataExt,
    },
    path::Path,
};

/// An open handle to a network namespace.
///
/// The handle keeps the namespace alive for as long as it is held; the underlying descriptor is
/// closed when the handle is dropped. Handles are never cloned: they are shared via `Arc` so that
/// there is exactly one descriptor per opened namespace.
pub struct Netns {
    file: File,
    inode: u64,
}

impl Netns {
    /// Opens the namespace bound at `path`, e.g. `/proc/<pid>/ns/net` or `/var/run/netns/<name>`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        File::open(path).and_then(Self::from_file)
    }

    pub fn from_file(file: File) -> io::Result<Self> {
        let inode = file.metadata()?.ino();
        Ok(Self { file, inode })
    }

    /// The namespace's inode number, which uniquely identifies it on the node.
    pub fn inode(&self) -> u64 {
        self.inode
    }
}

impl AsFd for Netns {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl fmt::Debug for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netns").field("inode", &self.inode).finish()
    }
}

impl PartialEq for Netns {
    fn eq(&self, other: &Self) -> bool {
        self.inode == other.inode
    }
}
