//! Names in the `shm_open` namespace.
use alloc::ffi::CString;
use alloc::string::String;
use core::ffi::CStr;

/// Longest name accepted, including the leading slash (`NAME_MAX`).
const NAME_MAX: usize = 255;

/// A validated shared memory object name.
///
/// Portable names are a single path component with a leading slash. A name given without the
/// slash gets one prepended, so `"store"` and `"/store"` refer to the same object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShmName {
    c_name: CString,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameError {
    /// No characters besides the leading slash.
    Empty,
    /// A slash after the first character.
    Separator,
    /// An interior NUL byte.
    Nul,
    /// Longer than `NAME_MAX`.
    TooLong,
}

impl ShmName {
    pub fn new(name: &str) -> Result<Self, NameError> {
        let bare = name.strip_prefix('/').unwrap_or(name);

        if bare.is_empty() {
            return Err(NameError::Empty);
        }

        if bare.contains('/') {
            return Err(NameError::Separator);
        }

        if bare.len() + 1 > NAME_MAX {
            return Err(NameError::TooLong);
        }

        let mut full = String::with_capacity(bare.len() + 1);
        full.push('/');
        full.push_str(bare);

        let c_name = CString::new(full).map_err(|_| NameError::Nul)?;
        Ok(ShmName { c_name })
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.c_name
    }

    /// The name including its leading slash.
    pub fn as_str(&self) -> &str {
        // Constructed from a `&str`, only a slash was added.
        self.c_name.to_str().unwrap_or("/")
    }
}

impl core::fmt::Display for ShmName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Display for NameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            NameError::Empty => "shared memory name is empty",
            NameError::Separator => "shared memory name contains a `/` after its first character",
            NameError::Nul => "shared memory name contains a NUL byte",
            NameError::TooLong => "shared memory name is longer than NAME_MAX",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for NameError {}

#[test]
fn leading_slash_is_optional() {
    let a = ShmName::new("store").unwrap();
    let b = ShmName::new("/store").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "/store");
}

#[test]
fn rejects_bad_names() {
    assert_eq!(ShmName::new("/"), Err(NameError::Empty));
    assert_eq!(ShmName::new(""), Err(NameError::Empty));
    assert_eq!(ShmName::new("/a/b"), Err(NameError::Separator));
    assert_eq!(ShmName::new("a\0b"), Err(NameError::Nul));

    let long = "x".repeat(NAME_MAX);
    assert_eq!(ShmName::new(&long), Err(NameError::TooLong));
}
