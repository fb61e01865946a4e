//! Per-type field tables that stand in for runtime reflection.
//!
//! A view-model lists its synced fields once; each descriptor carries typed
//! closures for reading (serialize), reaching nested observables, and
//! writing from a wire value.

use crate::command::CommandDescriptor;
use crate::observable::{Reach, WatchHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A root state object that can be registered as a sync node.
pub trait ViewModel: Sized + 'static {
    /// Synced fields, in snapshot order. Names are wire names and are
    /// matched case-insensitively.
    fn fields() -> Vec<FieldDescriptor<Self>>;

    /// Remotely callable methods.
    fn commands() -> Vec<CommandDescriptor<Self>> {
        Vec::new()
    }
}

/// Observable handles displaced and introduced by a field write.
pub(crate) struct Replaced {
    pub old: Vec<WatchHandle>,
    pub new: Vec<WatchHandle>,
}

type ReadFn<VM> = Box<dyn Fn(&VM) -> Result<Value, serde_json::Error>>;
type ReachFn<VM> = Box<dyn Fn(&VM, &mut Vec<WatchHandle>)>;
type WriteFn<VM> = Box<dyn Fn(&mut VM, Value) -> Result<Option<Replaced>, serde_json::Error>>;

pub struct FieldDescriptor<VM> {
    name: &'static str,
    read: ReadFn<VM>,
    reach: ReachFn<VM>,
    write: Option<WriteFn<VM>>,
}

impl<VM: 'static> FieldDescriptor<VM> {
    /// A field the UI may both observe and write.
    pub fn new<T, G, M>(name: &'static str, get: G, get_mut: M) -> Self
    where
        T: Serialize + DeserializeOwned + PartialEq + Reach + 'static,
        G: Fn(&VM) -> &T + Copy + 'static,
        M: Fn(&mut VM) -> &mut T + 'static,
    {
        let mut field = Self::read_only(name, get);
        field.write = Some(Box::new(move |vm: &mut VM, raw: Value| {
            let value: T = serde_json::from_value(raw)?;
            let slot = get_mut(vm);
            if *slot == value {
                return Ok(None);
            }

            let mut old = Vec::new();
            slot.reach(&mut old);
            *slot = value;
            let mut new = Vec::new();
            slot.reach(&mut new);

            Ok(Some(Replaced { old, new }))
        }));
        field
    }

    /// A field pushed to the UI but never written from it.
    pub fn read_only<T, G>(name: &'static str, get: G) -> Self
    where
        T: Serialize + Reach + 'static,
        G: Fn(&VM) -> &T + Copy + 'static,
    {
        Self {
            name,
            read: Box::new(move |vm: &VM| serde_json::to_value(get(vm))),
            reach: Box::new(move |vm: &VM, out: &mut Vec<WatchHandle>| get(vm).reach(out)),
            write: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    pub(crate) fn read(&self, vm: &VM) -> Result<Value, serde_json::Error> {
        (self.read)(vm)
    }

    pub(crate) fn reach(&self, vm: &VM) -> Vec<WatchHandle> {
        let mut out = Vec::new();
        (self.reach)(vm, &mut out);
        out
    }

    /// Read-only fields accept nothing; callers check [`Self::is_writable`]
    /// first.
    pub(crate) fn write(&self, vm: &mut VM, raw: Value) -> Result<Option<Replaced>, serde_json::Error> {
        match &self.write {
            Some(write) => write(vm, raw),
            None => Ok(None),
        }
    }
}

/// Case-insensitive lookup over a field table.
pub(crate) fn find_field<'a, VM>(
    fields: &'a [FieldDescriptor<VM>],
    name: &str,
) -> Option<&'a FieldDescriptor<VM>> {
    fields
        .iter()
        .find(|field| field.name == name)
        .or_else(|| fields.iter().find(|field| field.name.eq_ignore_ascii_case(name)))
}
