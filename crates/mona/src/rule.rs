//! Rules: user functions that create tasks instead of running.
//!
//! A rule is a `static` carrying its body, the body's token-normalized
//! source text, and the named references the body uses. The function hash —
//! SHA-1 of canonical JSON `{"ast_code": source, "globals": {name: tag}}` —
//! changes when the body or any referenced rule, helper function, library
//! version, or constant changes, which is what invalidates cached tasks on
//! code edits. Token normalization (via `stringify!`) already ignores
//! formatting and comments, so cosmetic edits do not invalidate.
//!
//! Rules self-register in a global name→rule table on first call, pulling in
//! the rules they reference, so cache restoration can resolve task specs
//! back to bodies.

use std::{cell::RefCell, collections::BTreeMap, sync::Arc};

use mona_hash::Hash;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::warn;

use crate::{
    error::{Error, RunError},
    hashing::HashedComposite,
    session::Session,
    task::{Task, TaskOpts},
    value::Value,
};

/// The signature of a rule body. Bodies are plain functions: they may call
/// other rules (creating tasks) and return a value that may embed futures.
pub type RuleBody = fn(Vec<Value>) -> Result<Value, RunError>;

/// A named reference a rule body depends on, for function hashing.
pub enum FuncDep {
    /// Another rule; tagged `func_hash:<hex>`, or `func_hash:self` when the
    /// reference cycles back to a rule currently being hashed.
    Rule(&'static Rule),
    /// A plain helper function (see [`Helper`] and the `helper!` macro);
    /// tagged `function:<hex>` over the helper's source digest, so editing
    /// a helper a rule delegates to invalidates the rule's cached tasks.
    Helper(&'static Helper),
    /// A versioned external library; tagged `<name>(<version>)`.
    Lib {
        name: &'static str,
        version: &'static str,
    },
    /// A constant value; tagged `hashed:<hashid>` for already-hashed values
    /// and `composite:<hashid>` otherwise.
    Const(fn() -> Value),
}

/// A plain function a rule body delegates to, captured with its
/// token-normalized source so it participates in the caller's function
/// hash. Defined via the `helper!` macro and listed in a rule's `helpers`
/// clause.
pub struct Helper {
    name: &'static str,
    source: &'static str,
}

impl Helper {
    pub const fn new(name: &'static str, source: &'static str) -> Helper {
        Helper { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Digest of the helper's source, in the same spec shape as a rule's
    /// function hash (helpers declare no references of their own).
    pub fn func_hash(&self) -> Result<Hash, Error> {
        digest_func(self.source, BTreeMap::new())
    }
}

pub struct Rule {
    name: &'static str,
    body: RuleBody,
    source: &'static str,
    uses: &'static [(&'static str, FuncDep)],
    func_hash: OnceCell<Hash>,
}

static REGISTRY: Lazy<Mutex<FxHashMap<&'static str, &'static Rule>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

thread_local! {
    static HASHING: RefCell<Vec<*const Rule>> = RefCell::new(Vec::new());
}

impl Rule {
    pub const fn new(
        name: &'static str,
        body: RuleBody,
        source: &'static str,
        uses: &'static [(&'static str, FuncDep)],
    ) -> Rule {
        Rule {
            name,
            body,
            source,
            uses,
            func_hash: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) -> Result<Value, RunError> {
        (self.body)(args)
    }

    /// Deterministic digest of the body source and its references.
    pub fn func_hash(&'static self) -> Result<Hash, Error> {
        if let Some(hash) = self.func_hash.get() {
            return Ok(hash.clone());
        }
        let ptr: *const Rule = self;
        HASHING.with(|stack| stack.borrow_mut().push(ptr));
        let result = self.compute_func_hash();
        HASHING.with(|stack| {
            stack.borrow_mut().pop();
        });
        let hash = result?;
        let _ = self.func_hash.set(hash.clone());
        Ok(hash)
    }

    fn compute_func_hash(&'static self) -> Result<Hash, Error> {
        let mut globals = BTreeMap::new();
        for (name, dep) in self.uses {
            let tag = dep.tag().map_err(|err| {
                Error::Hashing(format!("in rule {}, cannot hash {name}: {err}", self.name))
            })?;
            globals.insert(*name, tag);
        }
        digest_func(self.source, globals)
    }

    /// Add this rule (and, transitively, the rules it references) to the
    /// global registry used by cache restoration.
    pub fn register(&'static self) {
        let mut registry = REGISTRY.lock();
        let mut stack: Vec<&'static Rule> = vec![self];
        while let Some(rule) = stack.pop() {
            match registry.get(rule.name) {
                Some(existing) if std::ptr::eq(*existing, rule) => continue,
                Some(_) => {
                    warn!("rule name re-registered with a different body: {}", rule.name);
                }
                None => {}
            }
            registry.insert(rule.name, rule);
            for (_, dep) in rule.uses {
                if let FuncDep::Rule(dep) = dep {
                    stack.push(dep);
                }
            }
        }
    }

    pub fn lookup(name: &str) -> Option<&'static Rule> {
        REGISTRY.lock().get(name).copied()
    }

    /// Create a task in the active session; deduplicated by hashid.
    pub fn call(&'static self, args: impl IntoIterator<Item = Value>) -> Result<Arc<Task>, Error> {
        self.call_with(args, TaskOpts::default())
    }

    pub fn call_with(
        &'static self,
        args: impl IntoIterator<Item = Value>,
        mut opts: TaskOpts,
    ) -> Result<Arc<Task>, Error> {
        self.register();
        if opts.rule_name.is_none() {
            opts.rule_name = Some(self.name.to_string());
        }
        Session::active()?.create_task(self, args.into_iter().collect(), opts)
    }
}

impl FuncDep {
    fn tag(&self) -> Result<String, Error> {
        match self {
            FuncDep::Rule(rule) => {
                let ptr: *const Rule = *rule;
                let cycling = HASHING.with(|stack| stack.borrow().contains(&ptr));
                if cycling {
                    Ok("func_hash:self".to_string())
                } else {
                    Ok(format!("func_hash:{}", rule.func_hash()?))
                }
            }
            FuncDep::Helper(helper) => Ok(format!("function:{}", helper.func_hash()?)),
            FuncDep::Lib { name, version } => Ok(format!("{name}({version})")),
            FuncDep::Const(get) => match get() {
                Value::Obj(obj) => Ok(format!("hashed:{}", obj.hashid())),
                other => Ok(format!("composite:{}", HashedComposite::from_value(&other)?.hashid())),
            },
        }
    }
}

#[derive(Serialize)]
struct FuncSpec<'a> {
    ast_code: &'a str,
    globals: BTreeMap<&'static str, String>,
}

fn digest_func(source: &str, globals: BTreeMap<&'static str, String>) -> Result<Hash, Error> {
    let spec = serde_json::to_string(&FuncSpec {
        ast_code: source,
        globals,
    })
    .map_err(|err| Error::Hashing(err.to_string()))?;
    Ok(Hash::of_bytes(spec.as_bytes()))
}

/// Define a rule as a `static`.
///
/// ```ignore
/// rule! {
///     /// Sum two integers.
///     pub fn add(args) {
///         Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))
///     }
/// }
///
/// rule! {
///     pub fn fib(args) uses [fib, add] {
///         let n = args[0].as_int()?;
///         if n < 2 {
///             return Ok(Value::Int(n));
///         }
///         let a = fib.call([Value::Int(n - 1)])?;
///         let b = fib.call([Value::Int(n - 2)])?;
///         let t = add.call([a.as_obj().into(), b.as_obj().into()])?;
///         Ok(t.as_obj().into())
///     }
/// }
/// ```
///
/// The `uses` list names the rules the body references; it feeds both the
/// function hash and transitive registration. The `helpers` list names
/// [`Helper`] statics for plain functions the body delegates to, so edits
/// to their sources invalidate cached tasks too.
#[macro_export]
macro_rules! rule {
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($args:ident) $body:block
    ) => {
        $crate::rule! { $(#[$attr])* $vis fn $name($args) uses [] helpers [] $body }
    };
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($args:ident) uses [$($dep:ident),* $(,)?] $body:block
    ) => {
        $crate::rule! { $(#[$attr])* $vis fn $name($args) uses [$($dep),*] helpers [] $body }
    };
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($args:ident) helpers [$($helper:ident),* $(,)?] $body:block
    ) => {
        $crate::rule! { $(#[$attr])* $vis fn $name($args) uses [] helpers [$($helper),*] $body }
    };
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($args:ident)
            uses [$($dep:ident),* $(,)?]
            helpers [$($helper:ident),* $(,)?]
            $body:block
    ) => {
        $(#[$attr])*
        #[allow(non_upper_case_globals)]
        $vis static $name: $crate::Rule = $crate::Rule::new(
            stringify!($name),
            {
                const BODY: $crate::RuleBody = |$args: ::std::vec::Vec<$crate::Value>|
                    -> ::std::result::Result<$crate::Value, $crate::RunError> { $body };
                BODY
            },
            stringify!($body),
            &[
                $((stringify!($dep), $crate::FuncDep::Rule(&$dep)),)*
                $((stringify!($helper), $crate::FuncDep::Helper(&$helper)),)*
            ],
        );
    };
}

/// Define a plain helper function together with a [`Helper`] handle carrying
/// its token-normalized source, for use in a rule's `helpers` clause.
///
/// ```ignore
/// mona::helper! {
///     DOUBLE: fn double(x: i64) -> i64 {
///         x * 2
///     }
/// }
///
/// mona::rule! {
///     pub fn doubled(args) helpers [DOUBLE] {
///         Ok(Value::Int(double(args[0].as_int()?)))
///     }
/// }
/// ```
#[macro_export]
macro_rules! helper {
    (
        $(#[$attr:meta])*
        $dep:ident: $vis:vis fn $name:ident($($params:tt)*) $(-> $ret:ty)? $body:block
    ) => {
        $(#[$attr])*
        $vis fn $name($($params)*) $(-> $ret)? $body

        #[allow(non_upper_case_globals)]
        $vis static $dep: $crate::Helper = $crate::Helper::new(
            stringify!($name),
            stringify!(($($params)*) $(-> $ret)? $body),
        );
    };
}
