/// The error numbers handlers encode as `-errno` in the return register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EBADF = 9,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EINVAL = 22,
    ENOTTY = 25,
    ENOSYS = 38,
}

impl Errno {
    pub fn val(self) -> i64 {
        self as i64
    }
}
