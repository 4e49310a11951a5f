//! Canonical JSON encoding of composite values and byte specs.
//!
//! Every spec in the engine is JSON with sorted keys. Embedded hashed
//! objects are replaced by a `{"_type": "Hashed", "hashid": …}` sentinel and
//! recorded on a tape so the composite keeps its component set; registered
//! leaf types (paths) encode inline under their own `_type` tag. Decoding is
//! hook-based: the caller supplies what a `Hashed` sentinel resolves to.

use std::{collections::BTreeMap, sync::Arc};

use camino::Utf8PathBuf;
use mona_hash::Hash;
use serde_json::{json, Map as JsonMap, Number, Value as Json};

use crate::{
    error::Error,
    files::HashedFile,
    hashing::{HashedBytes, Obj},
    value::{Key, Value},
};

const TYPE_TAG: &str = "_type";
const HASHED_TAG: &str = "Hashed";
const PATH_TAG: &str = "Path";

/// Encode a value into its canonical JSON string, swapping bytes and files
/// into their hashed wrappers and collecting every embedded hashed object.
pub(crate) fn parse_value(value: &Value) -> Result<(String, Vec<Obj>), Error> {
    let mut tape = Tape::default();
    let encoded = encode(value, &mut tape)?;
    let jsonstr = serde_json::to_string(&encoded)
        .map_err(|err| Error::Composite(err.to_string()))?;
    Ok((jsonstr, tape.objs))
}

#[derive(Default)]
struct Tape {
    objs: Vec<Obj>,
    seen: rustc_hash::FxHashSet<Hash>,
}

impl Tape {
    fn record(&mut self, obj: Obj) -> Json {
        let sentinel = json!({ "_type": "Hashed", "hashid": obj.hashid().as_str() });
        if self.seen.insert(obj.hashid().clone()) {
            self.objs.push(obj);
        }
        sentinel
    }
}

fn encode(value: &Value, tape: &mut Tape) -> Result<Json, Error> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::Float(x) => Json::Number(
            Number::from_f64(*x)
                .ok_or_else(|| Error::Composite(format!("non-finite float: {x}")))?,
        ),
        Value::Str(s) => Json::String(s.clone()),
        Value::Path(p) => json!({ "_type": "Path", "path": p.as_str() }),
        Value::Bytes(b) => tape.record(Obj::Bytes(Arc::new(HashedBytes::new(b.clone())))),
        Value::File(f) => tape.record(Obj::File(Arc::new(HashedFile::from_file(f)))),
        Value::Obj(obj) => tape.record(obj.clone()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| encode(item, tape))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(map) => {
            let mut out = JsonMap::new();
            for (key, item) in map {
                out.insert(key.clone(), encode(item, tape)?);
            }
            Json::Object(out)
        }
    })
}

/// Decode a canonical JSON string back into a value. `hashed` is called for
/// every `Hashed` sentinel.
pub(crate) fn resolve_jsonstr(
    jsonstr: &str,
    hashed: &mut dyn FnMut(&Hash) -> Result<Value, Error>,
) -> Result<Value, Error> {
    let parsed: Json =
        serde_json::from_str(jsonstr).map_err(|err| Error::Composite(err.to_string()))?;
    decode(&parsed, hashed)
}

fn decode(
    json: &Json,
    hashed: &mut dyn FnMut(&Hash) -> Result<Value, Error>,
) -> Result<Value, Error> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(
                n.as_f64()
                    .ok_or_else(|| Error::Composite(format!("bad number: {n}")))?,
            ),
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(
            items
                .iter()
                .map(|item| decode(item, hashed))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(map) => match map.get(TYPE_TAG).and_then(Json::as_str) {
            Some(HASHED_TAG) => {
                let hashid = map
                    .get("hashid")
                    .and_then(Json::as_str)
                    .ok_or_else(|| Error::Composite("Hashed sentinel without hashid".into()))?;
                let hashid =
                    Hash::from_hex(hashid).map_err(|err| Error::Composite(err.to_string()))?;
                hashed(&hashid)?
            }
            Some(PATH_TAG) => {
                let path = map
                    .get("path")
                    .and_then(Json::as_str)
                    .ok_or_else(|| Error::Composite("Path sentinel without path".into()))?;
                Value::Path(Utf8PathBuf::from(path))
            }
            Some(other) => {
                return Err(Error::Composite(format!("unknown _type tag: {other:?}")))
            }
            None => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), decode(item, hashed)?);
                }
                Value::Map(out)
            }
        },
    })
}

/// Spec of a composite: the canonical JSON string followed by the sorted
/// hashids of its components.
pub(crate) fn composite_spec<'a>(
    jsonstr: &str,
    hashids: impl Iterator<Item = &'a Hash>,
) -> String {
    let mut parts = vec![Json::String(jsonstr.to_string())];
    parts.extend(hashids.map(|h| Json::String(h.as_str().to_string())));
    Json::Array(parts).to_string()
}

pub(crate) fn parse_composite_spec(spec: &[u8]) -> Result<(String, Vec<Hash>), Error> {
    let parts = parse_string_array(spec)?;
    let (jsonstr, hashids) = parts
        .split_first()
        .ok_or_else(|| Error::Composite("empty composite spec".into()))?;
    let hashids = hashids
        .iter()
        .map(|h| Hash::from_hex(h).map_err(|err| Error::Composite(err.to_string())))
        .collect::<Result<_, _>>()?;
    Ok((jsonstr.clone(), hashids))
}

pub(crate) fn file_spec(path: &camino::Utf8Path, content_hash: &Hash) -> String {
    Json::Array(vec![
        Json::String(path.to_string()),
        Json::String(content_hash.as_str().to_string()),
    ])
    .to_string()
}

pub(crate) fn parse_file_spec(spec: &[u8]) -> Result<(Utf8PathBuf, Hash), Error> {
    let parts = parse_string_array(spec)?;
    match parts.as_slice() {
        [path, hash] => Ok((
            Utf8PathBuf::from(path),
            Hash::from_hex(hash).map_err(|err| Error::Composite(err.to_string()))?,
        )),
        _ => Err(Error::Composite("malformed file spec".into())),
    }
}

pub(crate) fn task_spec(name: &str, func_hash: &Hash, args: impl Iterator<Item = Hash>) -> String {
    let mut parts = vec![
        Json::String(name.to_string()),
        Json::String(func_hash.as_str().to_string()),
    ];
    parts.extend(args.map(|h| Json::String(h.as_str().to_string())));
    Json::Array(parts).to_string()
}

pub(crate) fn parse_task_spec(spec: &[u8]) -> Result<(String, Hash, Vec<Hash>), Error> {
    let parts = parse_string_array(spec)?;
    match parts.split_first() {
        Some((name, rest)) if !rest.is_empty() => {
            let func_hash =
                Hash::from_hex(&rest[0]).map_err(|err| Error::Composite(err.to_string()))?;
            let args = rest[1..]
                .iter()
                .map(|h| Hash::from_hex(h).map_err(|err| Error::Composite(err.to_string())))
                .collect::<Result<_, _>>()?;
            Ok((name.clone(), func_hash, args))
        }
        _ => Err(Error::Composite("malformed task spec".into())),
    }
}

pub(crate) fn component_spec(task: &Hash, keys: &[Key]) -> String {
    let mut parts = vec![Json::String(task.as_str().to_string())];
    parts.extend(keys.iter().map(|key| match key {
        Key::Str(s) => Json::String(s.clone()),
        Key::Int(i) => Json::Number((*i).into()),
    }));
    Json::Array(parts).to_string()
}

pub(crate) fn parse_component_spec(spec: &[u8]) -> Result<(Hash, Vec<Key>), Error> {
    let parsed: Json =
        serde_json::from_slice(spec).map_err(|err| Error::Composite(err.to_string()))?;
    let parts = parsed
        .as_array()
        .ok_or_else(|| Error::Composite("malformed component spec".into()))?;
    let (task, keys) = parts
        .split_first()
        .ok_or_else(|| Error::Composite("empty component spec".into()))?;
    let task = task
        .as_str()
        .ok_or_else(|| Error::Composite("component spec without task hash".into()))?;
    let task = Hash::from_hex(task).map_err(|err| Error::Composite(err.to_string()))?;
    let keys = parts_to_keys(keys)?;
    Ok((task, keys))
}

fn parts_to_keys(parts: &[Json]) -> Result<Vec<Key>, Error> {
    parts
        .iter()
        .map(|part| match part {
            Json::String(s) => Ok(Key::Str(s.clone())),
            Json::Number(n) => n
                .as_u64()
                .map(Key::Int)
                .ok_or_else(|| Error::Composite(format!("bad index key: {n}"))),
            other => Err(Error::Composite(format!("bad index key: {other}"))),
        })
        .collect()
}

fn parse_string_array(spec: &[u8]) -> Result<Vec<String>, Error> {
    serde_json::from_slice::<Vec<String>>(spec)
        .map_err(|err| Error::Composite(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn keys_are_sorted() {
        let mut map = BTreeMap::new();
        map.insert("zeta".to_string(), Value::Int(1));
        map.insert("alpha".to_string(), Value::Int(2));
        let (jsonstr, components) = parse_value(&Value::Map(map)).unwrap();
        assert_eq!(jsonstr, r#"{"alpha":2,"zeta":1}"#);
        assert!(components.is_empty());
    }

    #[test]
    fn bytes_become_hashed_components() {
        let value = Value::List(vec![Value::bytes(&b"raw"[..]), Value::Int(3)]);
        let (jsonstr, components) = parse_value(&value).unwrap();
        assert_eq!(components.len(), 1);
        let hashid = components[0].hashid().clone();
        assert!(jsonstr.contains(r#""_type":"Hashed""#));
        assert!(jsonstr.contains(hashid.as_str()));

        let decoded = resolve_jsonstr(&jsonstr, &mut |h: &Hash| {
            assert_eq!(h, &hashid);
            components[0].value()
        })
        .unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn paths_encode_inline() {
        let value = Value::Path("inputs/data".into());
        let (jsonstr, components) = parse_value(&value).unwrap();
        assert!(components.is_empty());
        assert_eq!(jsonstr, r#"{"_type":"Path","path":"inputs/data"}"#);
        let decoded = resolve_jsonstr(&jsonstr, &mut |_: &Hash| unreachable!()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let err = parse_value(&Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, Error::Composite(_)));
    }

    #[test]
    fn string_keyed_specs_round_trip() {
        let hash = Hash::of_bytes(b"x");
        let spec = composite_spec("[1,2]", std::iter::once(&hash));
        let (jsonstr, hashids) = parse_composite_spec(spec.as_bytes()).unwrap();
        assert_eq!(jsonstr, "[1,2]");
        assert_eq!(hashids, vec![hash]);
    }

    #[test]
    fn component_specs_keep_key_kinds() {
        let task = Hash::of_bytes(b"task");
        let keys = vec![Key::Str("STDOUT".into()), Key::Int(2)];
        let spec = component_spec(&task, &keys);
        let (parsed_task, parsed_keys) = parse_component_spec(spec.as_bytes()).unwrap();
        assert_eq!(parsed_task, task);
        assert_eq!(parsed_keys, keys);
    }
}
