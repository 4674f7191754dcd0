bitflags::bitflags! {
    /// Flags accepted by [`crate::Filesystem::open_file`]. The interface is similar
    /// to the one by Linux.
    ///
    /// Flags that can be used here are specified in:
    /// - https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/fcntl.h
    /// - https://github.com/torvalds/linux/blob/master/include/linux/fcntl.h
    ///
    /// Linux defines each variant using the octal number format.
    pub struct OpenFlags: u32 {
        /// Open for reading only.
        const O_RDONLY = 0o0;
        /// Open for writing only.
        const O_WRONLY = 0o1;
        /// Opens a file for reading and writing.
        const O_RDWR = 0o2;
        /// Create file if it doesn't exist.
        const O_CREAT = 0o100;
        /// Truncates the file.
        const O_TRUNC = 0o1000;
        /// Append for all writes, regardless of the current file pointer.
        const O_APPEND = 0o2000;
        /// Set internally by 64-bit-offset-compatible libc wrappers; ignored here.
        const O_LARGEFILE = 0o100000;
        /// On EXEC-calls the FD must be closed. Irrelevant for a single-process guest.
        const O_CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    /// The lowest two bits encode the access mode, they are not independent flags.
    const ACC_MODE: u32 = 0o3;

    pub fn can_read(self) -> bool {
        let acc = self.bits() & Self::ACC_MODE;
        acc == Self::O_RDONLY.bits() || acc == Self::O_RDWR.bits()
    }
    pub fn can_write(self) -> bool {
        let acc = self.bits() & Self::ACC_MODE;
        acc == Self::O_WRONLY.bits() || acc == Self::O_RDWR.bits()
    }
    pub fn is_append(self) -> bool {
        self.contains(Self::O_APPEND)
    }
    pub fn can_create(self) -> bool {
        self.contains(Self::O_CREAT)
    }
    pub fn truncates(self) -> bool {
        self.contains(Self::O_TRUNC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_bits() {
        assert!(OpenFlags::O_RDONLY.can_read());
        assert!(!OpenFlags::O_RDONLY.can_write());
        assert!(OpenFlags::O_WRONLY.can_write());
        assert!(!OpenFlags::O_WRONLY.can_read());
        assert!(OpenFlags::O_RDWR.can_read() && OpenFlags::O_RDWR.can_write());
        assert!(
            (OpenFlags::O_CREAT | OpenFlags::O_WRONLY).can_write(),
            "O_CREAT must not disturb the access mode"
        );
    }
}
