//! Change-notifying values shared between application code and sync nodes.
//!
//! Everything here is single-threaded (`Rc` + `RefCell`): observables live on
//! the thread that owns the registry, and handlers run inline with the write
//! that triggered them.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Error as _, Serialize, SerializeSeq, Serializer};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of an observable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemsAction {
    Add,
    Remove,
    Replace,
    Move,
    Reset,
}

/// Structural change of an [`ObservableList`]. `added` and `removed` hold the
/// observables carried by the affected items, not the items themselves.
#[derive(Clone)]
pub struct ItemsChanged {
    pub action: ItemsAction,
    pub added: Vec<WatchHandle>,
    pub removed: Vec<WatchHandle>,
}

impl fmt::Debug for ItemsChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemsChanged")
            .field("action", &self.action)
            .field("added", &self.added.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Change {
    Field(String),
    Items(ItemsChanged),
}

pub type ChangeHandler = Rc<dyn Fn(&Change)>;

/// Type-erased view of anything a sync node can deep-watch.
pub trait Watchable {
    fn identity(&self) -> ObjectId;

    fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Observables directly reachable from this object's current contents.
    /// Returns nothing while the object is being mutated.
    fn children(&self) -> Vec<WatchHandle>;
}

pub type WatchHandle = Rc<dyn Watchable>;

/// Reports the observables a value carries.
///
/// Leaf values and plain containers carry none; `Observable` and
/// `ObservableList` report themselves; model structs report their observable
/// fields.
pub trait Reach {
    fn reach(&self, _out: &mut Vec<WatchHandle>) {}
}

macro_rules! leaf_reach {
    ($($ty:ty),* $(,)?) => {
        $(impl Reach for $ty {})*
    };
}

leaf_reach!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    serde_json::Value,
);

impl<T> Reach for Vec<T> {}

impl<K, V, S> Reach for HashMap<K, V, S> {}

impl<K, V> Reach for BTreeMap<K, V> {}

impl<T, S> Reach for HashSet<T, S> {}

impl<T: Reach> Reach for Option<T> {
    fn reach(&self, out: &mut Vec<WatchHandle>) {
        if let Some(value) = self {
            value.reach(out);
        }
    }
}

impl<T: Reach> Reach for Box<T> {
    fn reach(&self, out: &mut Vec<WatchHandle>) {
        (**self).reach(out);
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: Cell<u64>,
    handlers: RefCell<Vec<(SubscriptionId, ChangeHandler)>>,
}

impl Listeners {
    pub(crate) fn add(&self, handler: ChangeHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.handlers.borrow_mut().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.borrow().len()
    }

    fn contains(&self, id: SubscriptionId) -> bool {
        self.handlers.borrow().iter().any(|(existing, _)| *existing == id)
    }

    pub(crate) fn notify(&self, change: &Change) {
        // Handlers may subscribe or unsubscribe while we iterate.
        let snapshot: Vec<(SubscriptionId, ChangeHandler)> = self.handlers.borrow().clone();

        for (id, handler) in snapshot {
            if self.contains(id) {
                handler(change);
            }
        }
    }
}

struct ObservableInner<T> {
    id: ObjectId,
    value: RefCell<T>,
    listeners: Listeners,
}

impl<T: Reach + 'static> Watchable for ObservableInner<T> {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId {
        self.listeners.add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    fn children(&self) -> Vec<WatchHandle> {
        let mut out = Vec::new();
        if let Ok(value) = self.value.try_borrow() {
            value.reach(&mut out);
        }
        out
    }
}

/// A model object that reports field-level changes.
pub struct Observable<T> {
    inner: Rc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Reach + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(ObservableInner {
                id: ObjectId::next(),
                value: RefCell::new(value),
                listeners: Listeners::default(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&*self.inner.value.borrow())
    }

    /// Writes `value` into the field selected by `field` and notifies
    /// subscribers with `name`. Returns `false` without notifying when the
    /// stored value already equals `value`.
    pub fn set<V, F>(&self, name: &str, field: F, value: V) -> bool
    where
        V: PartialEq,
        F: FnOnce(&mut T) -> &mut V,
    {
        let previous = {
            let mut inner = self.inner.value.borrow_mut();
            let slot = field(&mut *inner);
            if *slot == value {
                return false;
            }
            std::mem::replace(slot, value)
        };
        drop(previous);

        self.inner.listeners.notify(&Change::Field(name.to_string()));
        true
    }

    /// Mutates the value in place and notifies unconditionally.
    pub fn modify<R>(&self, name: &str, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut *self.inner.value.borrow_mut());
        self.inner.listeners.notify(&Change::Field(name.to_string()));
        result
    }

    pub fn subscribe(&self, handler: impl Fn(&Change) + 'static) -> SubscriptionId {
        self.inner.listeners.add(Rc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn handle(&self) -> WatchHandle {
        self.inner.clone()
    }
}

impl<T: Reach + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> PartialEq for Observable<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Observable");
        out.field("id", &self.inner.id);
        match self.inner.value.try_borrow() {
            Ok(value) => out.field("value", &*value),
            Err(_) => out.field("value", &"<borrowed>"),
        };
        out.finish()
    }
}

impl<T: Reach + 'static> Reach for Observable<T> {
    fn reach(&self, out: &mut Vec<WatchHandle>) {
        out.push(self.handle());
    }
}

impl<T: Serialize> Serialize for Observable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self
            .inner
            .value
            .try_borrow()
            .map_err(|_| S::Error::custom("observable is being mutated"))?;
        value.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Reach + 'static> Deserialize<'de> for Observable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Self::new)
    }
}

struct ListInner<T> {
    id: ObjectId,
    items: RefCell<Vec<T>>,
    listeners: Listeners,
}

impl<T: Reach + 'static> Watchable for ListInner<T> {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId {
        self.listeners.add(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    fn children(&self) -> Vec<WatchHandle> {
        let mut out = Vec::new();
        if let Ok(items) = self.items.try_borrow() {
            for item in items.iter() {
                item.reach(&mut out);
            }
        }
        out
    }
}

/// An ordered collection that reports membership changes.
///
/// Item field changes are not reported by the list itself; sync nodes watch
/// observable items individually.
pub struct ObservableList<T> {
    inner: Rc<ListInner<T>>,
}

impl<T> Clone for ObservableList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

fn reach_all<'a, T: Reach + 'a>(items: impl IntoIterator<Item = &'a T>) -> Vec<WatchHandle> {
    let mut out = Vec::new();
    for item in items {
        item.reach(&mut out);
    }
    out
}

impl<T: Reach + 'static> ObservableList<T> {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            inner: Rc::new(ListInner {
                id: ObjectId::next(),
                items: RefCell::new(items),
                listeners: Listeners::default(),
            }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(self.inner.items.borrow().as_slice())
    }

    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.inner.items.borrow().get(index).cloned()
    }

    pub fn push(&self, item: T) {
        let added = reach_all([&item]);
        self.inner.items.borrow_mut().push(item);
        self.notify(ItemsAction::Add, added, Vec::new());
    }

    /// Inserts at `index`, clamped to the current length.
    pub fn insert(&self, index: usize, item: T) {
        let added = reach_all([&item]);
        {
            let mut items = self.inner.items.borrow_mut();
            let index = index.min(items.len());
            items.insert(index, item);
        }
        self.notify(ItemsAction::Add, added, Vec::new());
    }

    pub fn remove(&self, index: usize) -> Option<T> {
        let removed = {
            let mut items = self.inner.items.borrow_mut();
            if index >= items.len() {
                return None;
            }
            items.remove(index)
        };
        let handles = reach_all([&removed]);
        self.notify(ItemsAction::Remove, Vec::new(), handles);
        Some(removed)
    }

    /// Replaces the item at `index`, returning the previous one.
    pub fn replace(&self, index: usize, item: T) -> Option<T> {
        let added = reach_all([&item]);
        let previous = {
            let mut items = self.inner.items.borrow_mut();
            let slot = items.get_mut(index)?;
            std::mem::replace(slot, item)
        };
        let removed = reach_all([&previous]);
        self.notify(ItemsAction::Replace, added, removed);
        Some(previous)
    }

    pub fn move_item(&self, from: usize, to: usize) -> bool {
        {
            let mut items = self.inner.items.borrow_mut();
            if from >= items.len() || to >= items.len() {
                return false;
            }
            let item = items.remove(from);
            items.insert(to, item);
        }
        self.notify(ItemsAction::Move, Vec::new(), Vec::new());
        true
    }

    pub fn clear(&self) {
        let previous = std::mem::take(&mut *self.inner.items.borrow_mut());
        let removed = reach_all(previous.iter());
        self.notify(ItemsAction::Reset, Vec::new(), removed);
    }

    pub fn subscribe(&self, handler: impl Fn(&Change) + 'static) -> SubscriptionId {
        self.inner.listeners.add(Rc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn handle(&self) -> WatchHandle {
        self.inner.clone()
    }

    fn notify(&self, action: ItemsAction, added: Vec<WatchHandle>, removed: Vec<WatchHandle>) {
        self.inner.listeners.notify(&Change::Items(ItemsChanged {
            action,
            added,
            removed,
        }));
    }
}

impl<T: Reach + 'static> Default for ObservableList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reach + 'static> FromIterator<T> for ObservableList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<T> PartialEq for ObservableList<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for ObservableList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ObservableList");
        out.field("id", &self.inner.id);
        match self.inner.items.try_borrow() {
            Ok(items) => out.field("items", &*items),
            Err(_) => out.field("items", &"<borrowed>"),
        };
        out.finish()
    }
}

impl<T: Reach + 'static> Reach for ObservableList<T> {
    fn reach(&self, out: &mut Vec<WatchHandle>) {
        out.push(self.handle());
    }
}

impl<T: Serialize> Serialize for ObservableList<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let items = self
            .inner
            .items
            .try_borrow()
            .map_err(|_| S::Error::custom("observable list is being mutated"))?;
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items.iter() {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

impl<'de, T: Deserialize<'de> + Reach + 'static> Deserialize<'de> for ObservableList<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<T>::deserialize(deserializer).map(Self::from_vec)
    }
}
