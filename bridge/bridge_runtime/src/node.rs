//! Sync nodes: one registered view-model plus its deep-watch bookkeeping.
//!
//! A node reports every effective change reachable from its synced fields as
//! `(node id, root field name, full current value of that field)`. Nested
//! objects and collections are watched recursively; the root field under
//! which an object was first reached is the name it reports under.
//!
//! Objects are tracked by identity in a single watched set, so an object
//! reachable from two root fields is only reported under the first one
//! watched. Bookkeeping is keyed by `(root field, identity)` and unwatching
//! under a field that does not own the subscription is a no-op.

use crate::error::FieldError;
use crate::observable::{Change, ChangeHandler, Listeners, ObjectId, Reach, SubscriptionId, WatchHandle};
use crate::schema::{FieldDescriptor, ViewModel, find_field};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

/// Outbound hook: `(node id, root field name, current value)`.
pub type StateSink = Rc<dyn Fn(&str, &str, Value)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct WatchKey {
    field: &'static str,
    object: ObjectId,
}

struct WatchEntry {
    target: WatchHandle,
    subscription: SubscriptionId,
    children: Vec<WatchHandle>,
}

#[derive(Default)]
struct WatchTable {
    watched: HashSet<ObjectId>,
    entries: HashMap<WatchKey, WatchEntry>,
}

struct NodeCore<VM> {
    id: String,
    vm: RefCell<VM>,
    fields: Vec<FieldDescriptor<VM>>,
    sink: RefCell<Option<StateSink>>,
    watches: RefCell<WatchTable>,
    listeners: Listeners,
}

/// Shared handle to a registered view-model.
pub struct SyncNode<VM> {
    core: Rc<NodeCore<VM>>,
}

impl<VM> Clone for SyncNode<VM> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<VM: ViewModel> SyncNode<VM> {
    pub fn new(id: impl Into<String>, vm: VM) -> Self {
        Self {
            core: Rc::new(NodeCore {
                id: id.into(),
                vm: RefCell::new(vm),
                fields: VM::fields(),
                sink: RefCell::new(None),
                watches: RefCell::new(WatchTable::default()),
                listeners: Listeners::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn read<R>(&self, f: impl FnOnce(&VM) -> R) -> R {
        f(&*self.core.vm.borrow())
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.core.fields.iter().map(FieldDescriptor::name)
    }

    /// Installs the outbound hook and watches everything reachable from the
    /// synced fields. Re-attaching drops the previous watches first.
    pub fn attach(&self, sink: StateSink) {
        self.core.unwatch_all();
        *self.core.sink.borrow_mut() = Some(sink);

        let roots: Vec<(&'static str, Vec<WatchHandle>)> = {
            let vm = self.core.vm.borrow();
            self.core
                .fields
                .iter()
                .map(|field| (field.name(), field.reach(&vm)))
                .collect()
        };

        for (field, handles) in roots {
            for handle in handles {
                self.core.watch(field, handle);
            }
        }
    }

    /// Releases every subscription and the outbound hook.
    pub fn detach(&self) {
        self.core.unwatch_all();
        self.core.sink.borrow_mut().take();
    }

    /// Writes a root field and pushes its new value. Returns `false` for a
    /// no-op write.
    ///
    /// The push happens before the new value's subtree is watched, and the
    /// old value's subtree is unwatched before the write.
    pub fn set_field<T, F>(&self, name: &str, field: F, value: T) -> bool
    where
        T: Serialize + PartialEq + Reach,
        F: FnOnce(&mut VM) -> &mut T,
    {
        let descriptor = find_field(&self.core.fields, name);
        let canonical = descriptor.map(FieldDescriptor::name);

        let mut old_handles = Vec::new();
        let mut new_handles = Vec::new();
        let (previous, wire) = {
            let mut vm = self.core.vm.borrow_mut();
            let slot = field(&mut *vm);
            if *slot == value {
                return false;
            }
            slot.reach(&mut old_handles);
            let previous = std::mem::replace(slot, value);
            slot.reach(&mut new_handles);
            (previous, canonical.map(|_| serde_json::to_value(&*slot)))
        };

        if let Some(root) = canonical {
            for handle in old_handles {
                self.core.unwatch(root, handle);
            }
        }
        drop(previous);

        self.core.notify_local(name);

        let Some(root) = canonical else {
            tracing::warn!(
                node = %self.core.id,
                field = name,
                "set_field on an undeclared field; nothing pushed"
            );
            return true;
        };

        match wire {
            Some(Ok(value)) => self.core.push(root, value),
            Some(Err(err)) => tracing::warn!(
                node = %self.core.id,
                field = root,
                "failed to serialize field: {err}"
            ),
            None => {}
        }

        for handle in new_handles {
            self.core.watch(root, handle);
        }

        true
    }

    /// Mutates a root field in place, then reconciles watches beneath it and
    /// pushes its current value.
    pub fn modify_field<T, R, F, M>(&self, name: &str, field: F, mutate: M) -> R
    where
        T: Reach,
        F: FnOnce(&mut VM) -> &mut T,
        M: FnOnce(&mut T) -> R,
    {
        let (result, before, after) = {
            let mut vm = self.core.vm.borrow_mut();
            let slot = field(&mut *vm);
            let mut before = Vec::new();
            slot.reach(&mut before);
            let result = mutate(slot);
            let mut after = Vec::new();
            slot.reach(&mut after);
            (result, before, after)
        };

        if let Some(root) = find_field(&self.core.fields, name).map(FieldDescriptor::name) {
            self.core.reconcile(root, before, after);
        }
        self.core.manual_sync(name);
        result
    }

    /// Pushes the current value of a root field without writing it.
    pub fn manual_sync(&self, name: &str) -> bool {
        self.core.manual_sync(name)
    }

    /// Applies an inbound wire value to a field, logging and swallowing any
    /// failure. Never pushes back to the sender.
    pub fn set_field_by_name(&self, name: &str, value: Value) -> bool {
        match self.apply_field(name, value) {
            Ok(changed) => changed,
            Err(err) => {
                tracing::warn!(node = %self.core.id, field = name, "state set ignored: {err}");
                false
            }
        }
    }

    /// `Result` form of [`Self::set_field_by_name`].
    pub fn apply_field(&self, name: &str, value: Value) -> Result<bool, FieldError> {
        let core = &self.core;
        let descriptor = find_field(&core.fields, name).ok_or_else(|| FieldError::NotFound {
            node: core.id.clone(),
            field: name.to_string(),
        })?;

        if !descriptor.is_writable() {
            return Err(FieldError::ReadOnly {
                node: core.id.clone(),
                field: descriptor.name().to_string(),
            });
        }

        let replaced = {
            let mut vm = core.vm.try_borrow_mut().map_err(|_| FieldError::Busy {
                node: core.id.clone(),
            })?;
            descriptor
                .write(&mut vm, value)
                .map_err(|source| FieldError::Coercion {
                    node: core.id.clone(),
                    field: descriptor.name().to_string(),
                    source,
                })?
        };

        let Some(replaced) = replaced else {
            return Ok(false);
        };

        let root = descriptor.name();
        for handle in replaced.old {
            core.unwatch(root, handle);
        }
        core.notify_local(root);
        for handle in replaced.new {
            core.watch(root, handle);
        }

        Ok(true)
    }

    /// Current value of every synced field. Fields that fail to serialize
    /// are logged and left out.
    pub fn snapshot(&self) -> Map<String, Value> {
        let vm = self.core.vm.borrow();
        let mut state = Map::new();

        for field in &self.core.fields {
            match field.read(&vm) {
                Ok(value) => {
                    state.insert(field.name().to_string(), value);
                }
                Err(err) => tracing::warn!(
                    node = %self.core.id,
                    field = field.name(),
                    "field left out of snapshot: {err}"
                ),
            }
        }

        state
    }

    /// Subscribes to the root object's own change notification, for local
    /// bindings. Fires for outbound and inbound writes alike.
    pub fn subscribe(&self, handler: impl Fn(&Change) + 'static) -> SubscriptionId {
        self.core.listeners.add(Rc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.listeners.remove(id)
    }

    pub fn is_watching(&self, object: ObjectId) -> bool {
        self.core.watches.borrow().watched.contains(&object)
    }

    pub fn watch_count(&self) -> usize {
        self.core.watches.borrow().entries.len()
    }
}

impl<VM: ViewModel> NodeCore<VM> {
    fn notify_local(&self, name: &str) {
        self.listeners.notify(&Change::Field(name.to_string()));
    }

    fn push(&self, field: &str, value: Value) {
        let sink = self.sink.borrow().clone();
        if let Some(sink) = sink {
            sink(&self.id, field, value);
        }
    }

    fn manual_sync(&self, name: &str) -> bool {
        let Some(field) = find_field(&self.fields, name) else {
            tracing::debug!(node = %self.id, field = name, "manual sync of unknown field");
            return false;
        };

        let value = match self.vm.try_borrow() {
            Ok(vm) => field.read(&vm),
            Err(_) => {
                tracing::debug!(node = %self.id, field = field.name(), "state borrowed; sync deferred");
                return false;
            }
        };

        self.notify_local(field.name());

        match value {
            Ok(value) => {
                self.push(field.name(), value);
                true
            }
            Err(err) => {
                tracing::warn!(node = %self.id, field = field.name(), "failed to serialize field: {err}");
                false
            }
        }
    }

    fn watch(self: &Rc<Self>, field: &'static str, target: WatchHandle) {
        let object = target.identity();
        let key = WatchKey { field, object };

        {
            let mut table = self.watches.borrow_mut();
            if table.entries.contains_key(&key) || !table.watched.insert(object) {
                return;
            }
        }

        let node: Weak<Self> = Rc::downgrade(self);
        let handler: ChangeHandler = Rc::new(move |_change: &Change| {
            if let Some(core) = node.upgrade() {
                core.on_descendant_changed(key);
            }
        });
        let subscription = target.subscribe(handler);
        let children = target.children();

        self.watches.borrow_mut().entries.insert(
            key,
            WatchEntry {
                target,
                subscription,
                children: children.clone(),
            },
        );

        for child in children {
            self.watch(field, child);
        }
    }

    fn unwatch(self: &Rc<Self>, field: &'static str, target: WatchHandle) {
        let key = WatchKey {
            field,
            object: target.identity(),
        };

        let entry = {
            let mut table = self.watches.borrow_mut();
            let Some(entry) = table.entries.remove(&key) else {
                return;
            };
            table.watched.remove(&key.object);
            entry
        };

        entry.target.unsubscribe(entry.subscription);

        for child in entry.children {
            self.unwatch(field, child);
        }
    }

    fn unwatch_all(&self) {
        let entries: Vec<WatchEntry> = {
            let mut table = self.watches.borrow_mut();
            table.watched.clear();
            table.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.target.unsubscribe(entry.subscription);
        }
    }

    fn on_descendant_changed(self: &Rc<Self>, key: WatchKey) {
        let refreshed = {
            let table = self.watches.borrow();
            table
                .entries
                .get(&key)
                .map(|entry| (entry.target.clone(), entry.children.clone()))
        };

        if let Some((target, before)) = refreshed {
            let after = target.children();
            if let Some(entry) = self.watches.borrow_mut().entries.get_mut(&key) {
                entry.children = after.clone();
            }
            self.reconcile(key.field, before, after);
        }

        self.manual_sync(key.field);
    }

    /// Unwatches handles that left, watches handles that arrived.
    fn reconcile(self: &Rc<Self>, field: &'static str, before: Vec<WatchHandle>, after: Vec<WatchHandle>) {
        let before_ids: HashSet<ObjectId> = before.iter().map(|handle| handle.identity()).collect();
        let after_ids: HashSet<ObjectId> = after.iter().map(|handle| handle.identity()).collect();

        let mut departed = false;
        for handle in before {
            if !after_ids.contains(&handle.identity()) {
                self.unwatch(field, handle);
                departed = true;
            }
        }

        for handle in after {
            if !before_ids.contains(&handle.identity()) {
                self.watch(field, handle);
            }
        }

        if departed {
            self.rewalk(field);
        }
    }

    /// Re-watches anything still reachable from a root field that an
    /// unwatch cascade released, e.g. an object that left one parent but is
    /// still held by another, or the far side of a broken cycle.
    fn rewalk(self: &Rc<Self>, field: &'static str) {
        let roots = match (find_field(&self.fields, field), self.vm.try_borrow()) {
            (Some(descriptor), Ok(vm)) => descriptor.reach(&vm),
            _ => return,
        };

        let mut visited = HashSet::new();
        let mut pending = roots;
        while let Some(handle) = pending.pop() {
            let object = handle.identity();
            if !visited.insert(object) {
                continue;
            }

            let (owned, watched) = {
                let table = self.watches.borrow();
                (
                    table.entries.contains_key(&WatchKey { field, object }),
                    table.watched.contains(&object),
                )
            };

            if owned {
                pending.extend(handle.children());
            } else if !watched {
                self.watch(field, handle);
            }
        }
    }
}
