//! Per-kernel file-descriptor table.

use libramfs::RamFile;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;

/// A guest file descriptor. `-1` is the error value.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Hash, Ord, Eq)]
pub struct Fd(i32);

impl Fd {
    pub fn new(fd: i32) -> Self {
        Self(fd)
    }

    pub fn val(self) -> i32 {
        self.0
    }
}

impl From<u64> for Fd {
    fn from(raw: u64) -> Self {
        Self(raw as i32)
    }
}

/// Metadata an open file reports for `stat`-family calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
}

/// Character-device mode bits for the standard streams.
const S_IFCHR_RW: u32 = 0o20666;

/// An open file. The variants share the read/write/stat/seek/truncate
/// capability set; a variant that cannot honour an operation reports an
/// error instead.
#[derive(Debug)]
pub enum OpenFile {
    /// A file from the virtual filesystem.
    Ram(RamFile),
    /// Host standard streams.
    Stdin,
    Stdout,
    Stderr,
    /// A TCP connection standing in for stdio.
    Socket(TcpStream),
}

impl OpenFile {
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Ram(f) => f
                .read(buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            Self::Stdin => std::io::stdin().read(buf),
            Self::Stdout | Self::Stderr => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "read from output stream",
            )),
            Self::Socket(s) => s.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Ram(f) => f
                .write(buf)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            Self::Stdin => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "write to stdin",
            )),
            Self::Stdout => {
                let mut out = std::io::stdout();
                let n = out.write(buf)?;
                out.flush()?;
                Ok(n)
            }
            Self::Stderr => {
                let mut err = std::io::stderr();
                let n = err.write(buf)?;
                err.flush()?;
                Ok(n)
            }
            Self::Socket(s) => s.write(buf),
        }
    }

    pub fn seek(&mut self, offset: u64) -> std::io::Result<u64> {
        match self {
            Self::Ram(f) => Ok(f.seek(offset)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "seek on stream",
            )),
        }
    }

    pub fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        match self {
            Self::Ram(f) => f
                .truncate(len)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "truncate on stream",
            )),
        }
    }

    pub fn stat(&self) -> Option<FileStatInfo> {
        match self {
            Self::Ram(f) => {
                let meta = f.metadata();
                Some(FileStatInfo {
                    name: meta.path().to_string(),
                    size: meta.size(),
                    mode: meta.umode() as u32,
                })
            }
            Self::Stdin => Some(stream_stat("/dev/stdin")),
            Self::Stdout => Some(stream_stat("/dev/stdout")),
            Self::Stderr => Some(stream_stat("/dev/stderr")),
            // sockets have nothing useful to report
            Self::Socket(_) => None,
        }
    }
}

fn stream_stat(name: &str) -> FileStatInfo {
    FileStatInfo {
        name: name.to_string(),
        size: 0,
        mode: S_IFCHR_RW,
    }
}

/// Maps guest file descriptors to open files. Descriptors 0-2 are
/// pre-populated; allocation starts at 3 and is monotonic.
#[derive(Debug)]
pub struct FdTable {
    map: BTreeMap<Fd, OpenFile>,
    next_fd: i32,
}

impl FdTable {
    /// Standard streams wired to host stdio.
    pub fn with_stdio() -> Self {
        let mut map = BTreeMap::new();
        map.insert(Fd::new(0), OpenFile::Stdin);
        map.insert(Fd::new(1), OpenFile::Stdout);
        map.insert(Fd::new(2), OpenFile::Stderr);
        Self { map, next_fd: 3 }
    }

    /// Standard input and output redirected to an accepted TCP connection,
    /// stderr stays on the host.
    pub fn with_socket(stream: TcpStream) -> std::io::Result<Self> {
        let mut map = BTreeMap::new();
        map.insert(Fd::new(0), OpenFile::Socket(stream.try_clone()?));
        map.insert(Fd::new(1), OpenFile::Socket(stream));
        map.insert(Fd::new(2), OpenFile::Stderr);
        Ok(Self { map, next_fd: 3 })
    }

    pub fn insert(&mut self, file: OpenFile) -> Fd {
        let fd = Fd::new(self.next_fd);
        self.next_fd += 1;
        self.map.insert(fd, file);
        fd
    }

    pub fn get_mut(&mut self, fd: Fd) -> Option<&mut OpenFile> {
        self.map.get_mut(&fd)
    }

    pub fn get(&self, fd: Fd) -> Option<&OpenFile> {
        self.map.get(&fd)
    }

    pub fn remove(&mut self, fd: Fd) -> Option<OpenFile> {
        self.map.remove(&fd)
    }
}
