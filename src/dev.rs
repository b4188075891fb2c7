use std::fmt;

const MINORBITS: u32 = 20;
const MINORMASK: u32 = (1 << MINORBITS) - 1;

/// A device number in the kernel's internal `dev_t` encoding (`MKDEV`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dev(u32);

impl Dev {
    /// no device behind the file, or no file at all
    pub const UNKNOWN: Dev = Dev(0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Dev((major << MINORBITS) | (minor & MINORMASK))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u32 {
        self.0 >> MINORBITS
    }

    pub const fn minor(self) -> u32 {
        self.0 & MINORMASK
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// convert a user space `st_rdev`, which packs major and minor differently
    pub fn from_user(dev: libc::dev_t) -> Self {
        Self::new(libc::major(dev), libc::minor(dev))
    }
}

impl fmt::Display for Dev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}
