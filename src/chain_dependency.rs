//! The side-channel dependency store that travels alongside every promise.
//!
//! A [`ChainDependency`] is a small key/value bag whose write behaviour is
//! governed by a [`WritePolicy`] and whose accepted keys are governed by a
//! [`KeyAdmission`]. Promises never hold a store directly: they hold a
//! [`Dependency`], a cloneable handle that every promise derived from the
//! same chain shares, and that every handler receives next to the settled
//! value or reason.

use std::{
    any::{type_name, Any},
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Key of a dependency entry.
///
/// Keys are always explicit: a name, the compile-time name of a type
/// ([`of`](Self::of)), or the hash of a serializable value
/// ([`hashed`](Self::hashed)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyKey(String);

impl DependencyKey {
    /// A key with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        DependencyKey(name.into())
    }

    /// The key under which [`ChainDependency::add_typed`] stores a `T`.
    ///
    /// ```
    /// # use chainpromise::DependencyKey;
    /// assert_eq!(DependencyKey::of::<u32>().as_str(), "u32");
    /// ```
    pub fn of<T: ?Sized>() -> Self {
        DependencyKey(type_name::<T>().to_owned())
    }

    /// Normalises a non-string key by hashing its canonical JSON form.
    ///
    /// Keys that serialize to a JSON string are used verbatim.
    pub fn hashed<K: Serialize + ?Sized>(key: &K) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(key)? {
            Value::String(name) => Ok(DependencyKey(name)),
            other => {
                let mut hasher = DefaultHasher::new();
                other.to_string().hash(&mut hasher);
                Ok(DependencyKey(format!("{:016x}", hasher.finish())))
            }
        }
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DependencyKey {
    fn from(name: &str) -> Self {
        DependencyKey(name.to_owned())
    }
}

impl From<String> for DependencyKey {
    fn from(name: String) -> Self {
        DependencyKey(name)
    }
}

impl From<&DependencyKey> for DependencyKey {
    fn from(key: &DependencyKey) -> Self {
        key.clone()
    }
}

/// What happens when a key that already holds a value is written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritePolicy {
    /// The new value replaces the old one.
    #[default]
    #[serde(rename = "write_overwrite")]
    Overwrite,
    /// The first value sticks; later writes are ignored.
    #[serde(rename = "write_once")]
    WriteOnce,
    /// Values accumulate; reading returns all of them in write order.
    #[serde(rename = "write_merge")]
    Merge,
}

impl WritePolicy {
    /// Name accepted by [`ChainDependency::set_scenario`].
    pub fn as_str(&self) -> &'static str {
        match self {
            WritePolicy::Overwrite => "write_overwrite",
            WritePolicy::WriteOnce => "write_once",
            WritePolicy::Merge => "write_merge",
        }
    }
}

impl FromStr for WritePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write_overwrite" => Ok(WritePolicy::Overwrite),
            "write_once" => Ok(WritePolicy::WriteOnce),
            "write_merge" => Ok(WritePolicy::Merge),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// Which keys a store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAdmission {
    /// Any key is accepted.
    #[default]
    #[serde(rename = "arbitrary")]
    Arbitrary,
    /// Only keys registered with [`ChainDependency::set_map`] are accepted.
    #[serde(rename = "defined")]
    DefinedOnly,
}

impl KeyAdmission {
    /// Name accepted by [`ChainDependency::set_type`].
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAdmission::Arbitrary => "arbitrary",
            KeyAdmission::DefinedOnly => "defined",
        }
    }
}

impl FromStr for KeyAdmission {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arbitrary" => Ok(KeyAdmission::Arbitrary),
            "defined" => Ok(KeyAdmission::DefinedOnly),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// A policy name that is neither a [`WritePolicy`] nor a [`KeyAdmission`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown dependency policy `{0}`")]
pub struct UnknownPolicy(String);

/// Initial policies of a store.
///
/// ```
/// # use chainpromise::{DependencyConfig, KeyAdmission, WritePolicy};
/// let config: DependencyConfig = serde_json::from_str(r#"{"write_policy": "write_merge"}"#).unwrap();
/// assert_eq!(config.write_policy, WritePolicy::Merge);
/// assert_eq!(config.key_admission, KeyAdmission::Arbitrary);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Behaviour on repeated writes.
    pub write_policy: WritePolicy,
    /// Accepted keys.
    pub key_admission: KeyAdmission,
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Absent,
    Single(Value),
    Merged(Vec<Value>),
}

/// Key/value side-channel store.
#[derive(Debug)]
pub struct ChainDependency {
    id: u64,
    entries: HashMap<DependencyKey, Slot>,
    write_policy: WritePolicy,
    key_admission: KeyAdmission,
    merged_from: HashSet<u64>,
}

impl Default for ChainDependency {
    fn default() -> Self {
        Self::with_config(DependencyConfig::default())
    }
}

impl ChainDependency {
    /// An empty store with `Overwrite` and `Arbitrary` policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store with the given policies.
    pub fn with_config(config: DependencyConfig) -> Self {
        ChainDependency {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            entries: HashMap::new(),
            write_policy: config.write_policy,
            key_admission: config.key_admission,
            merged_from: HashSet::new(),
        }
    }

    /// Process-unique identity of this store.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current write policy.
    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    /// Current key admission.
    pub fn key_admission(&self) -> KeyAdmission {
        self.key_admission
    }

    /// Writes `value` under `key` according to the store's policies.
    ///
    /// Writes of `null`, and writes to unregistered keys while the store is
    /// in [`KeyAdmission::DefinedOnly`] mode, are dropped.
    pub fn add_dependency(&mut self, value: Value, key: impl Into<DependencyKey>) -> &mut Self {
        let key = key.into();
        if value.is_null() {
            trace!(%key, "ignoring null dependency");
            return self;
        }
        if self.key_admission == KeyAdmission::DefinedOnly && !self.entries.contains_key(&key) {
            trace!(%key, "dropping dependency for undefined key");
            return self;
        }
        let policy = self.write_policy;
        let slot = self.entries.entry(key).or_insert(Slot::Absent);
        *slot = match (policy, std::mem::replace(slot, Slot::Absent)) {
            (_, Slot::Absent) | (WritePolicy::Overwrite, _) => Slot::Single(value),
            (WritePolicy::WriteOnce, current) => current,
            (WritePolicy::Merge, Slot::Merged(mut values)) => {
                values.push(value);
                Slot::Merged(values)
            }
            (WritePolicy::Merge, Slot::Single(old)) => Slot::Merged(vec![old, value]),
        };
        self
    }

    /// Stores `value` under the name of its type, see [`DependencyKey::of`].
    ///
    /// A value that fails to serialize is dropped.
    pub fn add_typed<V: Serialize + ?Sized>(&mut self, value: &V) -> &mut Self {
        let key = DependencyKey::of::<V>();
        match serde_json::to_value(value) {
            Ok(value) => self.add_dependency(value, key),
            Err(err) => {
                trace!(%key, %err, "dropping unserializable dependency");
                self
            }
        }
    }

    /// The value stored under `key`.
    ///
    /// Merged entries are returned as a JSON array of every written value.
    pub fn get_dependency(&self, key: impl Into<DependencyKey>) -> Option<Value> {
        match self.entries.get(&key.into())? {
            Slot::Absent => None,
            Slot::Single(value) => Some(value.clone()),
            Slot::Merged(values) => Some(Value::Array(values.clone())),
        }
    }

    /// Like [`get_dependency`](Self::get_dependency) with a fallback.
    pub fn get_dependency_or(&self, key: impl Into<DependencyKey>, default: Value) -> Value {
        self.get_dependency(key).unwrap_or(default)
    }

    /// Deserializes the value stored under `key`.
    ///
    /// Returns `None` when the key is missing or the value does not fit `V`.
    pub fn get_as<V: DeserializeOwned>(&self, key: impl Into<DependencyKey>) -> Option<V> {
        self.get_dependency(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Whether a value has been written under `key`.
    pub fn has_dependency(&self, key: impl Into<DependencyKey>) -> bool {
        matches!(
            self.entries.get(&key.into()),
            Some(Slot::Single(_) | Slot::Merged(_))
        )
    }

    /// Resets the store to the given set of keys and only accepts those from
    /// now on.
    pub fn set_map<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<DependencyKey>,
    {
        self.flush();
        self.entries = keys
            .into_iter()
            .map(|key| (key.into(), Slot::Absent))
            .collect();
        self.key_admission = KeyAdmission::DefinedOnly;
        self
    }

    /// Removes every entry and forgets which stores were merged in.
    /// Policies are kept.
    pub fn flush(&mut self) -> &mut Self {
        self.entries.clear();
        self.merged_from.clear();
        self
    }

    /// Switches to [`WritePolicy::Overwrite`].
    pub fn scenario_overwrite(&mut self) -> &mut Self {
        self.write_policy = WritePolicy::Overwrite;
        self
    }

    /// Switches to [`WritePolicy::WriteOnce`].
    pub fn scenario_write_once(&mut self) -> &mut Self {
        self.write_policy = WritePolicy::WriteOnce;
        self
    }

    /// Switches to [`WritePolicy::Merge`].
    pub fn scenario_merge(&mut self) -> &mut Self {
        self.write_policy = WritePolicy::Merge;
        self
    }

    /// Switches the write policy by name. Unknown names keep the current one.
    pub fn set_scenario(&mut self, scenario: &str) -> &mut Self {
        match scenario.parse() {
            Ok(policy) => self.write_policy = policy,
            Err(err) => trace!(%err, "keeping write policy"),
        }
        self
    }

    /// Switches to [`KeyAdmission::Arbitrary`].
    pub fn type_arbitrary(&mut self) -> &mut Self {
        self.key_admission = KeyAdmission::Arbitrary;
        self
    }

    /// Switches to [`KeyAdmission::DefinedOnly`].
    pub fn type_defined_only(&mut self) -> &mut Self {
        self.key_admission = KeyAdmission::DefinedOnly;
        self
    }

    /// Switches the key admission by name. Unknown names keep the current one.
    pub fn set_type(&mut self, admission: &str) -> &mut Self {
        match admission.parse() {
            Ok(admission) => self.key_admission = admission,
            Err(err) => trace!(%err, "keeping key admission"),
        }
        self
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| !matches!(slot, Slot::Absent))
            .count()
    }

    /// Whether no key holds a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every written value with its key; merged entries yield one pair per
    /// value, in write order.
    pub fn snapshot(&self) -> Vec<(DependencyKey, Value)> {
        let mut pairs = Vec::new();
        for (key, slot) in &self.entries {
            match slot {
                Slot::Absent => {}
                Slot::Single(value) => pairs.push((key.clone(), value.clone())),
                Slot::Merged(values) => {
                    pairs.extend(values.iter().map(|value| (key.clone(), value.clone())))
                }
            }
        }
        pairs
    }
}

/// Shared handle to a [`ChainDependency`].
///
/// Cloning the handle shares the store. Every handler of a promise receives
/// the chain's handle, so anything written in one step is visible in the
/// next:
///
/// ```
/// # use chainpromise::{Chainable, Promise};
/// # use serde_json::json;
/// let p = Promise::new(|r| r.fulfill(1))
///     .map(|v, deps| {
///         deps.add_dependency(json!("alice"), "user");
///         Ok(v + 1)
///     })
///     .map(|v, deps| {
///         assert_eq!(deps.get_dependency("user"), Some(json!("alice")));
///         Ok(v * 10)
///     });
/// assert_eq!(p.wait(), Ok(20));
/// ```
#[derive(Clone)]
pub struct Dependency {
    slot: Arc<Mutex<Arc<Mutex<ChainDependency>>>>,
}

impl Default for Dependency {
    fn default() -> Self {
        Self::from_store(ChainDependency::new())
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.store();
        let store = store.lock();
        f.debug_struct("Dependency")
            .field("id", &store.id)
            .field("write_policy", &store.write_policy)
            .field("key_admission", &store.key_admission)
            .field("len", &store.len())
            .finish()
    }
}

impl Dependency {
    /// A handle to a fresh store with default policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to a fresh store with the given policies.
    pub fn with_config(config: DependencyConfig) -> Self {
        Self::from_store(ChainDependency::with_config(config))
    }

    /// Wraps an existing store.
    pub fn from_store(store: ChainDependency) -> Self {
        Dependency {
            slot: Arc::new(Mutex::new(Arc::new(Mutex::new(store)))),
        }
    }

    fn store(&self) -> Arc<Mutex<ChainDependency>> {
        self.slot.lock().clone()
    }

    /// Runs `f` with exclusive access to the store.
    ///
    /// `f` must not touch this handle again.
    pub fn with<R>(&self, f: impl FnOnce(&mut ChainDependency) -> R) -> R {
        let store = self.store();
        let mut guard = store.lock();
        f(&mut guard)
    }

    /// Identity of the store this handle currently points at.
    pub fn id(&self) -> u64 {
        self.with(|store| store.id())
    }

    /// Whether both handles point at the same store.
    pub fn same_store(&self, other: &Dependency) -> bool {
        Arc::ptr_eq(&self.store(), &other.store())
    }

    /// See [`ChainDependency::add_dependency`].
    pub fn add_dependency(&self, value: Value, key: impl Into<DependencyKey>) -> &Self {
        self.with(|store| {
            store.add_dependency(value, key);
        });
        self
    }

    /// See [`ChainDependency::add_typed`].
    pub fn add_typed<V: Serialize + ?Sized>(&self, value: &V) -> &Self {
        self.with(|store| {
            store.add_typed(value);
        });
        self
    }

    /// See [`ChainDependency::get_dependency`].
    pub fn get_dependency(&self, key: impl Into<DependencyKey>) -> Option<Value> {
        self.with(|store| store.get_dependency(key))
    }

    /// See [`ChainDependency::get_dependency_or`].
    pub fn get_dependency_or(&self, key: impl Into<DependencyKey>, default: Value) -> Value {
        self.with(|store| store.get_dependency_or(key, default))
    }

    /// See [`ChainDependency::get_as`].
    pub fn get_as<V: DeserializeOwned>(&self, key: impl Into<DependencyKey>) -> Option<V> {
        self.with(|store| store.get_as(key))
    }

    /// See [`ChainDependency::has_dependency`].
    pub fn has_dependency(&self, key: impl Into<DependencyKey>) -> bool {
        self.with(|store| store.has_dependency(key))
    }

    /// See [`ChainDependency::set_map`].
    pub fn set_map<I, K>(&self, keys: I) -> &Self
    where
        I: IntoIterator<Item = K>,
        K: Into<DependencyKey>,
    {
        self.with(|store| {
            store.set_map(keys);
        });
        self
    }

    /// See [`ChainDependency::flush`].
    pub fn flush(&self) -> &Self {
        self.with(|store| {
            store.flush();
        });
        self
    }

    /// See [`ChainDependency::scenario_overwrite`].
    pub fn scenario_overwrite(&self) -> &Self {
        self.with(|store| {
            store.scenario_overwrite();
        });
        self
    }

    /// See [`ChainDependency::scenario_write_once`].
    pub fn scenario_write_once(&self) -> &Self {
        self.with(|store| {
            store.scenario_write_once();
        });
        self
    }

    /// See [`ChainDependency::scenario_merge`].
    pub fn scenario_merge(&self) -> &Self {
        self.with(|store| {
            store.scenario_merge();
        });
        self
    }

    /// See [`ChainDependency::set_scenario`].
    pub fn set_scenario(&self, scenario: &str) -> &Self {
        self.with(|store| {
            store.set_scenario(scenario);
        });
        self
    }

    /// See [`ChainDependency::type_arbitrary`].
    pub fn type_arbitrary(&self) -> &Self {
        self.with(|store| {
            store.type_arbitrary();
        });
        self
    }

    /// See [`ChainDependency::type_defined_only`].
    pub fn type_defined_only(&self) -> &Self {
        self.with(|store| {
            store.type_defined_only();
        });
        self
    }

    /// See [`ChainDependency::set_type`].
    pub fn set_type(&self, admission: &str) -> &Self {
        self.with(|store| {
            store.set_type(admission);
        });
        self
    }

    /// Finds the first [`Dependency`] among positional arguments.
    pub fn instance_from_args(args: &[&dyn Any]) -> Option<Dependency> {
        args.iter()
            .find_map(|arg| arg.downcast_ref::<Dependency>())
            .cloned()
    }

    /// Reads `key` through the first [`Dependency`] among `args`.
    pub fn get_dependency_from_args(
        args: &[&dyn Any],
        key: impl Into<DependencyKey>,
        default: Option<Value>,
    ) -> Option<Value> {
        match Self::instance_from_args(args) {
            Some(dependency) => dependency.get_dependency(key).or(default),
            None => default,
        }
    }

    /// Writes `value` under `key` through the first [`Dependency`] among
    /// `args`, returning that handle.
    pub fn add_dependency_to_args(
        args: &[&dyn Any],
        value: Value,
        key: impl Into<DependencyKey>,
    ) -> Option<Dependency> {
        let dependency = Self::instance_from_args(args)?;
        dependency.add_dependency(value, key);
        Some(dependency)
    }
}

/// Folds every entry of `source` into `target`.
///
/// Entries are written through [`ChainDependency::add_dependency`], so the
/// target's policies decide collisions. A given source store is merged into
/// a target store at most once. With `reassign`, `source` is redirected to
/// the target store afterwards and every clone of it observes the merged
/// state.
pub fn merge_dependencies(target: &Dependency, source: &Dependency, reassign: bool) {
    let target_store = target.store();
    let source_store = source.store();
    if !Arc::ptr_eq(&target_store, &source_store) {
        let (source_id, source_merged, entries) = {
            let source = source_store.lock();
            (source.id, source.merged_from.clone(), source.snapshot())
        };
        let mut target = target_store.lock();
        if target.merged_from.insert(source_id) {
            trace!(
                target = target.id,
                source = source_id,
                entries = entries.len(),
                "merging dependencies"
            );
            for (key, value) in entries {
                target.add_dependency(value, key);
            }
            target.merged_from.extend(source_merged);
        }
    }
    if reassign {
        *source.slot.lock() = target_store;
    }
}
