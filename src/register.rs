//! Register states and the object field model layered over their payload.

use std::collections::BTreeMap;

use num_traits::FromPrimitive;

use crate::common::{checksum, Genesis, U256};
use crate::core::params::STATE_VERSION;
use crate::stream::{
    read_compact_size, write_compact_size, Decode, Encode, Stream,
    StreamError,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
#[repr(u8)]
pub enum RegisterType {
    Raw = 0x01,
    Append = 0x02,
    Readonly = 0x03,
    Object = 0x04,
    System = 0x05,
}

/// Tags of the records embedded in a contract's register stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
#[repr(u8)]
pub enum StateTag {
    PreState = 0x01,
    PostState = 0x02,
}

/// One addressable register. `owner` is zero while a transfer is pending.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct State {
    pub version: u8,
    pub kind: RegisterType,
    pub owner: Genesis,
    pub created: u64,
    pub modified: u64,
    pub checksum: u64,
    pub data: Vec<u8>,
}

impl State {
    pub fn new(
        kind: RegisterType, owner: Genesis, timestamp: u64, data: Vec<u8>,
    ) -> Self {
        let mut state = Self {
            version: STATE_VERSION,
            kind,
            owner,
            created: timestamp,
            modified: timestamp,
            checksum: 0,
            data,
        };
        state.set_checksum();
        state
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        (self.kind as u8).encode(out);
        self.owner.encode(out);
        self.created.encode(out);
        self.modified.encode(out);
        self.data.encode(out);
    }

    pub fn compute_checksum(&self) -> u64 {
        let mut body = Vec::with_capacity(64 + self.data.len());
        self.encode_body(&mut body);
        checksum(&body)
    }

    #[inline]
    pub fn set_checksum(&mut self) {
        self.checksum = self.compute_checksum()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    #[inline(always)]
    pub fn is_owned_by(&self, genesis: &Genesis) -> bool {
        &self.owner == genesis
    }

    pub fn object(&self) -> Result<Object, ObjectError> {
        if self.kind != RegisterType::Object {
            return Err(ObjectError::NotObject)
        }
        Object::from_bytes(&self.data)
    }
}

impl Encode for State {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_body(out);
        self.checksum.encode(out);
    }
}

impl Decode for State {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        let version = s.read()?;
        let tag: u8 = s.read()?;
        let kind = RegisterType::from_u8(tag)
            .ok_or(StreamError::InvalidTag(tag))?;
        Ok(Self {
            version,
            kind,
            owner: s.read()?,
            created: s.read()?,
            modified: s.read()?,
            data: s.read()?,
            checksum: s.read()?,
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("malformed object: {0}")]
    Decode(#[from] StreamError),
    #[error("register is not an object")]
    NotObject,
    #[error("field `{0}` does not exist")]
    NotFound(String),
    #[error("field `{0}` is immutable")]
    Immutable(String),
    #[error("field `{0}` has a different type")]
    TypeMismatch(String),
    #[error("field `{0}` defined twice")]
    Duplicate(String),
    #[error("empty field name")]
    EmptyName,
    #[error("field `{0}` overflows")]
    Overflow(String),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, FromPrimitive)]
#[repr(u8)]
pub enum FieldType {
    U8 = 0x01,
    U16 = 0x02,
    U32 = 0x03,
    U64 = 0x04,
    U256 = 0x05,
    String = 0x06,
    Bytes = 0x07,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U256(U256),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::U8(_) => FieldType::U8,
            Value::U16(_) => FieldType::U16,
            Value::U32(_) => FieldType::U32,
            Value::U64(_) => FieldType::U64,
            Value::U256(_) => FieldType::U256,
            Value::String(_) => FieldType::String,
            Value::Bytes(_) => FieldType::Bytes,
        }
    }
}

impl Encode for Value {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.field_type() as u8).encode(out);
        match self {
            Value::U8(v) => v.encode(out),
            Value::U16(v) => v.encode(out),
            Value::U32(v) => v.encode(out),
            Value::U64(v) => v.encode(out),
            Value::U256(v) => v.encode(out),
            Value::String(v) => v.encode(out),
            Value::Bytes(v) => v.encode(out),
        }
    }
}

impl Decode for Value {
    fn decode(s: &mut Stream) -> Result<Self, StreamError> {
        let tag: u8 = s.read()?;
        Ok(match FieldType::from_u8(tag) {
            Some(FieldType::U8) => Value::U8(s.read()?),
            Some(FieldType::U16) => Value::U16(s.read()?),
            Some(FieldType::U32) => Value::U32(s.read()?),
            Some(FieldType::U64) => Value::U64(s.read()?),
            Some(FieldType::U256) => Value::U256(s.read()?),
            Some(FieldType::String) => Value::String(s.read()?),
            Some(FieldType::Bytes) => Value::Bytes(s.read()?),
            None => return Err(StreamError::InvalidTag(tag)),
        })
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Field {
    pub mutable: bool,
    pub value: Value,
}

/// Well-known object layouts, recognized by their field set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Standard {
    Base,
    Account,
    Token,
    Trust,
}

impl Standard {
    #[inline]
    pub fn has_balance(&self) -> bool {
        !matches!(self, Standard::Base)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Object {
    fields: BTreeMap<String, Field>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fungible account holding `balance` of token `token` (zero is the native coin).
    pub fn account(token: U256, balance: u64) -> Self {
        Self::new()
            .with("balance", Value::U64(balance), true)
            .with("token", Value::U256(token), false)
    }

    pub fn token(token: U256, supply: u64, digits: u8) -> Self {
        Self::new()
            .with("balance", Value::U64(supply), true)
            .with("supply", Value::U64(supply), false)
            .with("token", Value::U256(token), false)
            .with("digits", Value::U8(digits), false)
    }

    pub fn trust() -> Self {
        Self::new()
            .with("balance", Value::U64(0), true)
            .with("trust", Value::U64(0), true)
            .with("stake", Value::U64(0), true)
            .with("token", Value::U256(U256::zero()), false)
    }

    pub fn with(mut self, name: &str, value: Value, mutable: bool) -> Self {
        self.fields.insert(name.into(), Field { mutable, value });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|f| &f.value)
    }

    pub fn get_u64(&self, name: &str) -> Result<u64, ObjectError> {
        match self.get(name) {
            Some(Value::U64(v)) => Ok(*v),
            Some(_) => Err(ObjectError::TypeMismatch(name.into())),
            None => Err(ObjectError::NotFound(name.into())),
        }
    }

    pub fn get_u256(&self, name: &str) -> Result<U256, ObjectError> {
        match self.get(name) {
            Some(Value::U256(v)) => Ok(*v),
            Some(_) => Err(ObjectError::TypeMismatch(name.into())),
            None => Err(ObjectError::NotFound(name.into())),
        }
    }

    /// Update an existing mutable field, keeping its type.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ObjectError> {
        let field = self
            .fields
            .get_mut(name)
            .ok_or_else(|| ObjectError::NotFound(name.into()))?;
        if !field.mutable {
            return Err(ObjectError::Immutable(name.into()))
        }
        if field.value.field_type() != value.field_type() {
            return Err(ObjectError::TypeMismatch(name.into()))
        }
        field.value = value;
        Ok(())
    }

    pub fn add_u64(&mut self, name: &str, v: u64) -> Result<(), ObjectError> {
        let cur = self.get_u64(name)?;
        let new = cur
            .checked_add(v)
            .ok_or_else(|| ObjectError::Overflow(name.into()))?;
        self.set(name, Value::U64(new))
    }

    pub fn sub_u64(&mut self, name: &str, v: u64) -> Result<(), ObjectError> {
        let cur = self.get_u64(name)?;
        let new = cur
            .checked_sub(v)
            .ok_or_else(|| ObjectError::Overflow(name.into()))?;
        self.set(name, Value::U64(new))
    }

    fn has(&self, name: &str, t: FieldType) -> bool {
        self.get(name).map(|v| v.field_type() == t).unwrap_or(false)
    }

    pub fn standard(&self) -> Standard {
        let base = self.has("balance", FieldType::U64) &&
            self.has("token", FieldType::U256);
        if !base {
            return Standard::Base
        }
        if self.has("trust", FieldType::U64) && self.has("stake", FieldType::U64)
        {
            Standard::Trust
        } else if self.has("supply", FieldType::U64) {
            Standard::Token
        } else {
            Standard::Account
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_compact_size(self.fields.len() as u64, &mut out);
        for (name, field) in self.fields.iter() {
            name.encode(&mut out);
            field.mutable.encode(&mut out);
            field.value.encode(&mut out);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ObjectError> {
        let mut s = Stream::from_bytes(bytes.to_vec());
        let n = read_compact_size(&mut s)?;
        let mut fields = BTreeMap::new();
        for _ in 0..n {
            let name: String = s.read()?;
            if name.is_empty() {
                return Err(ObjectError::EmptyName)
            }
            let mutable = s.read()?;
            let value = s.read()?;
            if fields.insert(name.clone(), Field { mutable, value }).is_some() {
                return Err(ObjectError::Duplicate(name))
            }
        }
        s.expect_end()?;
        Ok(Self { fields })
    }
}

#[test]
fn test_state_codec_and_checksum() {
    let owner = Genesis::hash(b"alice");
    let state = State::new(RegisterType::Raw, owner.clone(), 7, vec![1, 2, 3]);
    assert!(state.is_valid());
    let mut s = Stream::new();
    s.write(&state);
    let back: State = s.read().unwrap();
    assert_eq!(back, state);
    assert!(s.at_end());

    let mut moved = state.clone();
    moved.owner = Genesis::zero().clone();
    assert!(!moved.is_valid());
    moved.set_checksum();
    assert_ne!(moved.checksum, state.checksum);
}

#[test]
fn test_state_bad_type() {
    let state = State::new(RegisterType::Raw, Genesis::zero().clone(), 0, vec![]);
    let mut bytes = Vec::new();
    state.encode(&mut bytes);
    bytes[1] = 0x42;
    assert_eq!(
        Stream::from_bytes(bytes).read::<State>(),
        Err(StreamError::InvalidTag(0x42))
    );
}

#[test]
fn test_object_fields() {
    let mut obj = Object::account(U256::zero(), 10);
    assert_eq!(obj.standard(), Standard::Account);
    obj.add_u64("balance", 5).unwrap();
    assert_eq!(obj.get_u64("balance").unwrap(), 15);
    assert_eq!(
        obj.set("token", Value::U256(U256::one())),
        Err(ObjectError::Immutable("token".into()))
    );
    assert_eq!(
        obj.set("balance", Value::U8(1)),
        Err(ObjectError::TypeMismatch("balance".into()))
    );
    assert_eq!(
        obj.sub_u64("balance", 16),
        Err(ObjectError::Overflow("balance".into()))
    );
    assert!(matches!(obj.set("name", Value::U8(1)), Err(ObjectError::NotFound(_))));

    let back = Object::from_bytes(&obj.to_bytes()).unwrap();
    assert_eq!(back, obj);
}

#[test]
fn test_object_standards() {
    assert_eq!(Object::trust().standard(), Standard::Trust);
    assert_eq!(Object::token(U256::from(7), 100, 2).standard(), Standard::Token);
    let plain = Object::new().with("name", Value::String("x".into()), true);
    assert_eq!(plain.standard(), Standard::Base);
    assert!(!Standard::Base.has_balance());
}

#[test]
fn test_object_rejects_garbage() {
    let mut bytes = Object::trust().to_bytes();
    bytes.push(0);
    assert_eq!(Object::from_bytes(&bytes), Err(ObjectError::Decode(StreamError::Trailing(1))));
    // two fields, both named "a"
    let mut dup = Vec::new();
    write_compact_size(2, &mut dup);
    for _ in 0..2 {
        "a".encode(&mut dup);
        true.encode(&mut dup);
        Value::U8(1).encode(&mut dup);
    }
    assert_eq!(Object::from_bytes(&dup), Err(ObjectError::Duplicate("a".into())));
}
