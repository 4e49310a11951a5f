//! The JSON-like composite value model.
//!
//! [`Value`] is the currency of the engine: rule arguments, task results, and
//! defaults are all values. A value is a nested container of string-keyed
//! maps, lists, and scalars, extended with three leaf kinds the plain JSON
//! model lacks: raw bytes, repository-relative paths, and [`File`] handles.
//! A value may also embed an already-hashed object ([`Value::Obj`]), which is
//! how futures flow through argument lists.

use std::collections::BTreeMap;

use bytes::Bytes;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, RunError},
    files::File,
    hashing::Obj,
};

/// A key used to index into a task's result (`task["STDOUT"]`, `list[0]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    Str(String),
    Int(u64),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Str(s) => write!(f, "{s:?}"),
            Key::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<u64> for Key {
    fn from(i: u64) -> Self {
        Key::Int(i)
    }
}

/// A JSON-like composite that may embed hashed objects.
///
/// Serialization (used for task metadata and opaque cached results) covers
/// the plain subset only; embedded objects are identities tied to a session
/// and refuse to serialize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Path(Utf8PathBuf),
    File(File),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    #[serde(skip)]
    Obj(Obj),
}

impl Value {
    pub fn as_bool(&self) -> Result<bool, RunError> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(self.type_error("bool")),
        }
    }

    pub fn as_int(&self) -> Result<i64, RunError> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(self.type_error("int")),
        }
    }

    pub fn as_str(&self) -> Result<&str, RunError> {
        match self {
            Value::Str(s) => Ok(s),
            _ => Err(self.type_error("str")),
        }
    }

    pub fn as_file(&self) -> Result<&File, RunError> {
        match self {
            Value::File(f) => Ok(f),
            _ => Err(self.type_error("file")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], RunError> {
        match self {
            Value::List(items) => Ok(items),
            _ => Err(self.type_error("list")),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>, RunError> {
        match self {
            Value::Map(map) => Ok(map),
            _ => Err(self.type_error("map")),
        }
    }

    /// Index one level into a map or list.
    pub fn index(&self, key: &Key) -> Result<Value, Error> {
        match (self, key) {
            (Value::Map(map), Key::Str(k)) => map
                .get(k)
                .cloned()
                .ok_or_else(|| Error::Composite(format!("no such key: {k:?}"))),
            (Value::List(items), Key::Int(i)) => items
                .get(*i as usize)
                .cloned()
                .ok_or_else(|| Error::Composite(format!("index out of range: {i}"))),
            _ => Err(Error::Composite(format!(
                "cannot index {} with {key}",
                self.kind()
            ))),
        }
    }

    /// Wrap raw content as a bytes value.
    pub fn bytes(content: impl Into<Bytes>) -> Self {
        Value::Bytes(content.into())
    }

    /// Short type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Path(_) => "path",
            Value::File(_) => "file",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Obj(_) => "object",
        }
    }

    fn type_error(&self, wanted: &str) -> RunError {
        RunError::Fatal(Error::InvalidInput(format!(
            "expected {wanted}, got {}",
            self.kind()
        )))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(p: Utf8PathBuf) -> Self {
        Value::Path(p)
    }
}

impl From<File> for Value {
    fn from(f: File) -> Self {
        Value::File(f)
    }
}

impl From<Obj> for Value {
    fn from(obj: Obj) -> Self {
        Value::Obj(obj)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::List(iter.into_iter().collect())
    }
}
