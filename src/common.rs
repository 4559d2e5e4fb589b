use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hex::{FromHex, ToHex};
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::{H256, H512};
use serde::{
    de::{self, Deserialize, Deserializer, Visitor},
    Serialize, Serializer,
};
use sha3::Digest;

/// Address of one register.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Address(H256);

/// Identity of one signature chain.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Genesis(H256);

/// Hash of a transaction (Keccak-512).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct TxHash(H512);

macro_rules! impl_hash_wrapper {
    ($name: ident, $inner: ident, $size: expr) => {
        impl $name {
            #[inline]
            pub fn zero() -> &'static Self {
                static V: OnceCell<$name> = OnceCell::new();
                V.get_or_init(|| Self($inner::zero()))
            }

            #[inline(always)]
            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            #[inline(always)]
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            #[inline(always)]
            pub fn from_slice(s: &[u8]) -> Self {
                Self($inner::from_slice(s))
            }

            #[inline]
            pub fn to_fixed_bytes(&self) -> [u8; $size] {
                self.0.to_fixed_bytes()
            }
        }

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                Self($inner(bytes))
            }
        }

        impl FromStr for $name {
            type Err = ();
            fn from_str(s: &str) -> Result<Self, ()> {
                Ok(Self($inner::from_str(s).map_err(|_| ())?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&BytesRef(self.as_bytes()), f)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                BytesRef::serialize(&BytesRef(self.as_bytes()), serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                use serde::de::Error;
                let bytes = deserializer.deserialize_str(BytesVisitor)?;
                if bytes.len() != $size {
                    return Err(D::Error::invalid_length(
                        bytes.len(),
                        &concat!("length of ", stringify!($size), " bytes"),
                    ))
                }
                Ok($name::from_slice(&bytes))
            }
        }
    };
}

impl_hash_wrapper!(Address, H256, 32);
impl_hash_wrapper!(Genesis, H256, 32);
impl_hash_wrapper!(TxHash, H512, 64);

// Address

impl Address {
    /// Derive a register address from arbitrary bytes (e.g. a name).
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self(keccak256(slice))
    }
}

/// A coinbase credit names its recipient's genesis as the proof address.
impl From<&Genesis> for Address {
    fn from(g: &Genesis) -> Self {
        Self(g.0)
    }
}

// Genesis

impl Genesis {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self(keccak256(slice))
    }
}

// TxHash

impl TxHash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak512::digest(slice).as_slice())
    }
}

#[inline(always)]
pub fn keccak256(slice: &[u8]) -> H256 {
    H256::from_slice(sha3::Keccak256::digest(slice).as_slice())
}

/// 64-bit checksum: the leading 8 bytes (little endian) of the Keccak-256 digest.
#[inline]
pub fn checksum(slice: &[u8]) -> u64 {
    let digest = sha3::Keccak256::digest(slice);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Seconds since the UNIX epoch.
pub fn unified_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Cooperative shutdown flag polled by long scans.
#[derive(Clone, Default, Debug)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl<'a> Serialize for BytesRef<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{:x}", &self))
    }
}

pub struct BytesVisitor;
impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("starts with `0x` and has even number of hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<Vec<u8>, E>
    where
        E: de::Error,
    {
        if value.len() < 2 {
            return Err(de::Error::invalid_length(value.len(), &self))
        }
        let bytes = value.as_bytes();
        if bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
            Vec::from_hex(&value[2..]).map_err(|_| {
                de::Error::invalid_value(de::Unexpected::Str(value), &self)
            })
        } else {
            Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }
}

#[test]
fn test_hash_wrapper_serde() {
    let addr = Address::hash(b"savings");
    let json = serde_json::to_string(&addr).unwrap();
    assert_eq!(json, format!("\"0x{:x}\"", addr));
    let back: Address = serde_json::from_str(&json).unwrap();
    assert_eq!(back, addr);
    assert!(serde_json::from_str::<Genesis>("\"0x00ff\"").is_err());
    assert!(serde_json::from_str::<TxHash>("\"00ff\"").is_err());
}

#[test]
fn test_zero_and_checksum() {
    assert!(TxHash::zero().is_zero());
    assert!(!TxHash::hash(b"").is_zero());
    assert_eq!(checksum(b"abc"), checksum(b"abc"));
    assert_ne!(checksum(b"abc"), checksum(b"abd"));
    let g = Genesis::hash(b"alice");
    assert_eq!(Address::from(&g).as_bytes(), g.as_bytes());
}
