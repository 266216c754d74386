//! Hashing and equality of keys.
//!
//! Both are part of the stored map: every process attached to a map must agree on them, so they
//! are selected by a persisted [`KeyFold`] instead of a per-process hasher.

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub(crate) const fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(PRIME);
        i += 1;
    }
    hash
}

/// How keys are compared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum KeyFold {
    /// Keys are equal when their bytes are.
    #[default]
    Exact,
    /// Keys are equal up to ASCII case.
    AsciiCaseInsensitive,
}

impl KeyFold {
    pub fn hash(self, key: &[u8]) -> u64 {
        match self {
            KeyFold::Exact => fnv1a(key),
            KeyFold::AsciiCaseInsensitive => key.iter().fold(OFFSET_BASIS, |hash, byte| {
                (hash ^ u64::from(byte.to_ascii_lowercase())).wrapping_mul(PRIME)
            }),
        }
    }

    pub fn eq(self, a: &[u8], b: &[u8]) -> bool {
        match self {
            KeyFold::Exact => a == b,
            KeyFold::AsciiCaseInsensitive => a.eq_ignore_ascii_case(b),
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        match self {
            KeyFold::Exact => 0,
            KeyFold::AsciiCaseInsensitive => 1,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        match raw {
            1 => KeyFold::AsciiCaseInsensitive,
            _ => KeyFold::Exact,
        }
    }
}

#[test]
fn fnv_reference_values() {
    assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
    assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
}

#[test]
fn folded_keys_agree() {
    let fold = KeyFold::AsciiCaseInsensitive;
    assert_eq!(fold.hash(b"Key-01"), fold.hash(b"kEY-01"));
    assert!(fold.eq(b"Key-01", b"kEY-01"));
    assert_eq!(fold.hash(b"key"), fnv1a(b"key"));

    assert_ne!(KeyFold::Exact.hash(b"Key"), KeyFold::Exact.hash(b"key"));
    assert!(!KeyFold::Exact.eq(b"Key", b"key"));
    assert_eq!(KeyFold::from_raw(fold.to_raw()), fold);
}
