//! The hashed-object taxonomy.
//!
//! Everything with durable identity exposes a byte spec and the SHA-1 of
//! that spec (its hashid). [`Obj`] is the closed set of hashed kinds the
//! engine knows how to store and reconstruct; the round-trip law is that
//! `from_spec(obj.spec(), resolver)` rebuilds an object with the same
//! hashid, with the resolver supplying components by hash.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use mona_hash::Hash;

use crate::{
    error::Error,
    files::HashedFile,
    futures::Fut,
    json,
    task::{Task, TaskComponent, TaskComposite},
    util::shorten_text,
    value::Value,
};

/// Resolves a hashid to the live object it names, typically against a cache
/// or a component table.
pub trait Resolver {
    fn resolve(&mut self, hash: &Hash) -> Result<Obj, Error>;
}

impl<F: FnMut(&Hash) -> Result<Obj, Error>> Resolver for F {
    fn resolve(&mut self, hash: &Hash) -> Result<Obj, Error> {
        self(hash)
    }
}

/// A dynamic handle to any hashed object.
#[derive(Clone)]
pub enum Obj {
    Bytes(Arc<HashedBytes>),
    File(Arc<HashedFile>),
    Composite(Arc<HashedComposite>),
    Task(Arc<Task>),
    Component(Arc<TaskComponent>),
    TaskComposite(Arc<TaskComposite>),
}

/// Weak counterpart of [`Obj`] for instance caches.
#[derive(Clone)]
pub enum WeakObj {
    Bytes(Weak<HashedBytes>),
    File(Weak<HashedFile>),
    Composite(Weak<HashedComposite>),
    Task(Weak<Task>),
    Component(Weak<TaskComponent>),
    Composite2(Weak<TaskComposite>),
}

impl WeakObj {
    pub fn upgrade(&self) -> Option<Obj> {
        Some(match self {
            WeakObj::Bytes(w) => Obj::Bytes(w.upgrade()?),
            WeakObj::File(w) => Obj::File(w.upgrade()?),
            WeakObj::Composite(w) => Obj::Composite(w.upgrade()?),
            WeakObj::Task(w) => Obj::Task(w.upgrade()?),
            WeakObj::Component(w) => Obj::Component(w.upgrade()?),
            WeakObj::Composite2(w) => Obj::TaskComposite(w.upgrade()?),
        })
    }
}

impl Obj {
    pub fn hashid(&self) -> &Hash {
        match self {
            Obj::Bytes(o) => o.hashid(),
            Obj::File(o) => o.hashid(),
            Obj::Composite(o) => o.hashid(),
            Obj::Task(o) => o.hashid(),
            Obj::Component(o) => o.hashid(),
            Obj::TaskComposite(o) => o.hashid(),
        }
    }

    /// Stable tag naming the concrete kind; the `typetag` column of the
    /// objects table.
    pub fn typetag(&self) -> &'static str {
        match self {
            Obj::Bytes(_) => "bytes",
            Obj::File(_) => "file",
            Obj::Composite(_) => "composite",
            Obj::Task(_) => "task",
            Obj::Component(_) => "task_component",
            Obj::TaskComposite(_) => "task_composite",
        }
    }

    pub fn spec(&self) -> Vec<u8> {
        match self {
            Obj::Bytes(o) => o.content().to_vec(),
            Obj::File(o) => o.spec(),
            Obj::Composite(o) => o.spec(),
            Obj::Task(o) => o.spec().as_bytes().to_vec(),
            Obj::Component(o) => o.spec(),
            Obj::TaskComposite(o) => o.spec(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Obj::Bytes(o) => o.label(),
            Obj::File(o) => o.label(),
            Obj::Composite(o) => o.label(),
            Obj::Task(o) => o.label(),
            Obj::Component(o) => o.label(),
            Obj::TaskComposite(o) => o.label(),
        }
    }

    /// Hashed instances the reconstructor will need to resolve.
    pub fn components(&self) -> Vec<Obj> {
        match self {
            Obj::Bytes(_) | Obj::Task(_) => Vec::new(),
            Obj::File(o) => o.components(),
            Obj::Composite(o) => o.components(),
            Obj::Component(o) => vec![Obj::Task(o.task().clone())],
            Obj::TaskComposite(o) => o.components(),
        }
    }

    pub fn metadata(&self) -> Option<Vec<u8>> {
        match self {
            Obj::Task(o) => o.metadata(),
            Obj::Component(o) => o.metadata(),
            _ => None,
        }
    }

    pub fn set_metadata(&self, metadata: &[u8]) -> Result<(), Error> {
        match self {
            Obj::Task(o) => o.set_metadata(metadata),
            Obj::Component(o) => o.set_metadata(metadata),
            _ => Ok(()),
        }
    }

    pub fn as_fut(&self) -> Option<Fut> {
        match self {
            Obj::Task(o) => Some(Fut::Task(o.clone())),
            Obj::Component(o) => Some(Fut::Component(o.clone())),
            Obj::TaskComposite(o) => Some(Fut::Composite(o.clone())),
            _ => None,
        }
    }

    /// The plain value of this object; futures must be done.
    pub fn value(&self) -> Result<Value, Error> {
        match self {
            Obj::Bytes(o) => Ok(Value::Bytes(o.content().clone())),
            Obj::File(o) => Ok(Value::File(o.value())),
            Obj::Composite(o) => o.resolve(&mut |comp| comp.value()),
            Obj::Task(o) => {
                if o.done() {
                    o.result()
                } else {
                    Err(Error::NotDone(o.label()))
                }
            }
            Obj::Component(o) => o.value(),
            Obj::TaskComposite(o) => {
                if o.done() {
                    o.resolve(&mut |comp| comp.value())
                } else {
                    Err(Error::NotDone(o.label()))
                }
            }
        }
    }

    /// Like [`Obj::value`], but unfinished futures fall back to their
    /// configured defaults (speculative execution).
    pub fn value_or_default(&self) -> Result<Value, Error> {
        match self.as_fut() {
            Some(fut) => fut.value_or_default(),
            None => match self {
                Obj::Composite(o) => o.resolve(&mut |comp| comp.value_or_default()),
                _ => self.value(),
            },
        }
    }

    pub fn downgrade(&self) -> WeakObj {
        match self {
            Obj::Bytes(o) => WeakObj::Bytes(Arc::downgrade(o)),
            Obj::File(o) => WeakObj::File(Arc::downgrade(o)),
            Obj::Composite(o) => WeakObj::Composite(Arc::downgrade(o)),
            Obj::Task(o) => WeakObj::Task(Arc::downgrade(o)),
            Obj::Component(o) => WeakObj::Component(Arc::downgrade(o)),
            Obj::TaskComposite(o) => WeakObj::Composite2(Arc::downgrade(o)),
        }
    }
}

/// Equality is by hashid.
impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        self.hashid() == other.hashid()
    }
}

impl Eq for Obj {}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}: {}>", self.typetag(), self.hashid().tag(), self.label())
    }
}

/// Reconstruct an object from its stored typetag and spec bytes.
pub fn obj_from_spec(typetag: &str, spec: &[u8], resolve: &mut dyn Resolver) -> Result<Obj, Error> {
    Ok(match typetag {
        "bytes" => Obj::Bytes(Arc::new(HashedBytes::new(Bytes::copy_from_slice(spec)))),
        "file" => Obj::File(Arc::new(HashedFile::from_spec(spec, resolve)?)),
        "composite" => Obj::Composite(Arc::new(HashedComposite::from_spec(spec, resolve)?)),
        "task" => Obj::Task(Task::from_spec(spec, resolve)?),
        "task_component" => Obj::Component(TaskComponent::from_spec(spec, resolve)?),
        "task_composite" => Obj::TaskComposite(TaskComposite::from_spec(spec, resolve)?),
        other => return Err(Error::Composite(format!("unknown typetag: {other:?}"))),
    })
}

/// Trivially hashed byte content; the spec is the content itself.
#[derive(Debug)]
pub struct HashedBytes {
    content: Bytes,
    hashid: Hash,
}

impl HashedBytes {
    pub fn new(content: Bytes) -> HashedBytes {
        let hashid = Hash::of_bytes(&content);
        HashedBytes { content, hashid }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn hashid(&self) -> &Hash {
        &self.hashid
    }

    pub fn label(&self) -> String {
        format!("{:?}", shorten_text(&self.content, 20))
    }
}

/// A JSON-like container that may embed other hashed objects.
#[derive(Debug)]
pub struct HashedComposite {
    jsonstr: String,
    components: BTreeMap<Hash, Obj>,
    hashid: Hash,
}

impl HashedComposite {
    pub(crate) fn new(jsonstr: String, components: Vec<Obj>) -> HashedComposite {
        let components: BTreeMap<Hash, Obj> = components
            .into_iter()
            .map(|obj| (obj.hashid().clone(), obj))
            .collect();
        let hashid = Hash::of_bytes(json::composite_spec(&jsonstr, components.keys()).as_bytes());
        HashedComposite {
            jsonstr,
            components,
            hashid,
        }
    }

    /// Hash a plain value (no futures allowed); used for composite constants
    /// referenced by rule bodies.
    pub fn from_value(value: &Value) -> Result<HashedComposite, Error> {
        let (jsonstr, components) = json::parse_value(value)?;
        if components.iter().any(|comp| comp.as_fut().is_some()) {
            return Err(Error::Composite("composite constant contains a future".into()));
        }
        Ok(HashedComposite::new(jsonstr, components))
    }

    pub fn from_spec(spec: &[u8], resolve: &mut dyn Resolver) -> Result<HashedComposite, Error> {
        let (jsonstr, hashids) = json::parse_composite_spec(spec)?;
        let components = hashids
            .iter()
            .map(|h| resolve.resolve(h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HashedComposite::new(jsonstr, components))
    }

    pub fn hashid(&self) -> &Hash {
        &self.hashid
    }

    pub fn spec(&self) -> Vec<u8> {
        json::composite_spec(&self.jsonstr, self.components.keys()).into_bytes()
    }

    pub fn label(&self) -> String {
        shorten_text(self.jsonstr.as_bytes(), 50)
    }

    pub(crate) fn jsonstr(&self) -> &str {
        &self.jsonstr
    }

    pub(crate) fn component(&self, hash: &Hash) -> Option<&Obj> {
        self.components.get(hash)
    }

    pub fn components(&self) -> Vec<Obj> {
        self.components.values().cloned().collect()
    }

    /// Decode the container, mapping each embedded object through `handler`.
    pub fn resolve(
        &self,
        handler: &mut dyn FnMut(&Obj) -> Result<Value, Error>,
    ) -> Result<Value, Error> {
        json::resolve_jsonstr(&self.jsonstr, &mut |hash| {
            let comp = self
                .components
                .get(hash)
                .ok_or_else(|| Error::Composite(format!("missing component: {hash}")))?;
            handler(comp)
        })
    }
}

/// Coerce a value into a hashed object.
///
/// Hashed objects pass through unchanged; raw bytes and files are swapped
/// into their hashed wrappers; anything else becomes a composite — a
/// future-bearing [`TaskComposite`] if the value embeds unfinished work.
pub fn ensure_hashed(value: Value) -> Result<Obj, Error> {
    Ok(match value {
        Value::Obj(obj) => obj,
        Value::Bytes(content) => Obj::Bytes(Arc::new(HashedBytes::new(content))),
        Value::File(file) => Obj::File(Arc::new(HashedFile::from_file(&file))),
        other => {
            let (jsonstr, components) = json::parse_value(&other)?;
            if components.iter().any(|comp| comp.as_fut().is_some()) {
                Obj::TaskComposite(TaskComposite::new(jsonstr, components))
            } else {
                Obj::Composite(Arc::new(HashedComposite::new(jsonstr, components)))
            }
        }
    })
}

/// Like [`ensure_hashed`], but returns `None` for values that cannot be
/// expressed as a composite instead of failing.
pub fn maybe_hashed(value: &Value) -> Result<Option<Obj>, Error> {
    match ensure_hashed(value.clone()) {
        Ok(obj) => Ok(Some(obj)),
        Err(Error::Composite(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_for(components: Vec<Obj>) -> impl FnMut(&Hash) -> Result<Obj, Error> {
        move |hash: &Hash| {
            components
                .iter()
                .find(|comp| comp.hashid() == hash)
                .cloned()
                .ok_or_else(|| Error::Composite(format!("unknown component: {hash}")))
        }
    }

    #[test]
    fn bytes_spec_is_the_content() {
        let hashed = HashedBytes::new(bytes::Bytes::from_static(b"payload"));
        assert_eq!(hashed.hashid(), &Hash::of_bytes(b"payload"));
        let obj = Obj::Bytes(Arc::new(hashed));
        assert_eq!(obj.spec(), b"payload");
    }

    #[test]
    fn raw_bytes_swap_to_their_hashed_wrapper() {
        let obj = ensure_hashed(Value::bytes(&b"blob"[..])).unwrap();
        assert!(matches!(obj, Obj::Bytes(_)));
        assert_eq!(obj.hashid(), &Hash::of_bytes(b"blob"));
    }

    #[test]
    fn composite_round_trips_through_its_spec() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("n".to_string(), Value::Int(7));
        map.insert("blob".to_string(), Value::bytes(&b"abc"[..]));
        let obj = ensure_hashed(Value::Map(map)).unwrap();
        let Obj::Composite(composite) = &obj else {
            panic!("expected a composite");
        };

        let rebuilt =
            HashedComposite::from_spec(&obj.spec(), &mut resolver_for(obj.components())).unwrap();
        assert_eq!(rebuilt.hashid(), composite.hashid());
        assert_eq!(Obj::Composite(Arc::new(rebuilt)).value().unwrap(), obj.value().unwrap());
    }

    #[test]
    fn equal_values_hash_equal_regardless_of_construction() {
        let via_list = ensure_hashed(Value::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        let via_iter = ensure_hashed(vec![1i64, 2].into_iter().map(Value::from).collect()).unwrap();
        assert_eq!(via_list.hashid(), via_iter.hashid());
    }

    #[test]
    fn unhashable_values_are_maybe_none() {
        assert!(maybe_hashed(&Value::Float(f64::INFINITY)).unwrap().is_none());
        assert!(maybe_hashed(&Value::Int(3)).unwrap().is_some());
    }
}
