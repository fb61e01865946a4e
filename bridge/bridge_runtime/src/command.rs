//! Remotely callable methods: descriptors, argument coercion, invocation.

use crate::error::CommandError;
use crate::node::SyncNode;
use crate::schema::ViewModel;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

type Coerce = fn(Value) -> Result<Box<dyn Any>, serde_json::Error>;
type Fallback = Rc<dyn Fn() -> Box<dyn Any>>;
type Handler<VM> = Rc<dyn Fn(&SyncNode<VM>, &mut Arguments) -> Result<Option<Value>, CommandError>>;

fn coerce<T: DeserializeOwned + 'static>(raw: Value) -> Result<Box<dyn Any>, serde_json::Error> {
    serde_json::from_value::<T>(raw).map(|value| Box::new(value) as Box<dyn Any>)
}

/// Describes one declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamInfo {
    pub name: &'static str,
    pub type_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Signature metadata for tooling that derives client-side accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSignature {
    pub name: &'static str,
    pub params: Vec<ParamInfo>,
    pub returns_value: bool,
}

#[derive(Clone)]
struct Param {
    info: ParamInfo,
    coerce: Coerce,
    fallback: Fallback,
}

/// Coerced argument values, in declaration order.
pub struct Arguments {
    values: Vec<Option<Box<dyn Any>>>,
}

impl Arguments {
    /// Moves the argument at `index` out as `T`. Each argument can be taken
    /// once.
    pub fn take<T: 'static>(&mut self, index: usize) -> Result<T, CommandError> {
        let mismatch = || CommandError::ArgumentType {
            index,
            expected: type_name::<T>(),
        };
        let slot = self.values.get_mut(index).ok_or_else(mismatch)?;
        let value = slot.take().ok_or_else(mismatch)?;
        match value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(original) => {
                *slot = Some(original);
                Err(mismatch())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A remotely callable method on `VM`, declared once per type.
pub struct CommandDescriptor<VM> {
    name: &'static str,
    params: Vec<Param>,
    returns_value: bool,
    handler: Handler<VM>,
}

impl<VM: ViewModel> CommandDescriptor<VM> {
    pub fn new(name: &'static str) -> CommandBuilder<VM> {
        CommandBuilder {
            name,
            params: Vec::new(),
            _vm: std::marker::PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> CommandSignature {
        CommandSignature {
            name: self.name,
            params: self.params.iter().map(|param| param.info.clone()).collect(),
            returns_value: self.returns_value,
        }
    }
}

pub struct CommandBuilder<VM> {
    name: &'static str,
    params: Vec<Param>,
    _vm: std::marker::PhantomData<fn(&VM)>,
}

impl<VM: ViewModel> CommandBuilder<VM> {
    /// A parameter that falls back to `T::default()` when absent.
    pub fn param<T>(mut self, name: &'static str) -> Self
    where
        T: DeserializeOwned + Default + 'static,
    {
        self.params.push(Param {
            info: ParamInfo {
                name,
                type_name: type_name::<T>(),
                default: None,
            },
            coerce: coerce::<T>,
            fallback: Rc::new(|| Box::new(T::default()) as Box<dyn Any>),
        });
        self
    }

    /// A parameter with a declared default.
    pub fn param_or<T>(mut self, name: &'static str, default: T) -> Self
    where
        T: DeserializeOwned + Serialize + Clone + 'static,
    {
        self.params.push(Param {
            info: ParamInfo {
                name,
                type_name: type_name::<T>(),
                default: serde_json::to_value(&default).ok(),
            },
            coerce: coerce::<T>,
            fallback: Rc::new(move || Box::new(default.clone()) as Box<dyn Any>),
        });
        self
    }

    /// Finishes a command with no return value.
    pub fn action<F>(self, f: F) -> CommandDescriptor<VM>
    where
        F: Fn(&SyncNode<VM>, &mut Arguments) -> Result<(), CommandError> + 'static,
    {
        self.finish(
            false,
            Rc::new(move |node: &SyncNode<VM>, args: &mut Arguments| {
                f(node, args).map(|()| None)
            }),
        )
    }

    /// Finishes a command whose result is sent back to the caller.
    pub fn returns<R, F>(self, f: F) -> CommandDescriptor<VM>
    where
        R: Serialize,
        F: Fn(&SyncNode<VM>, &mut Arguments) -> Result<R, CommandError> + 'static,
    {
        self.finish(
            true,
            Rc::new(move |node: &SyncNode<VM>, args: &mut Arguments| {
                let result = f(node, args)?;
                serde_json::to_value(result)
                    .map(Some)
                    .map_err(CommandError::Result)
            }),
        )
    }

    fn finish(self, returns_value: bool, handler: Handler<VM>) -> CommandDescriptor<VM> {
        CommandDescriptor {
            name: self.name,
            params: self.params,
            returns_value,
            handler,
        }
    }
}

struct BoundCommand {
    signature: CommandSignature,
    params: Vec<Param>,
    invoke: Box<dyn Fn(&mut Arguments) -> Result<Option<Value>, CommandError>>,
}

impl BoundCommand {
    fn resolve(&self, args: Option<&Map<String, Value>>) -> Result<Arguments, CommandError> {
        let mut values = Vec::with_capacity(self.params.len());

        for param in &self.params {
            let supplied = args.and_then(|args| lookup_arg(args, param.info.name));
            let value = match supplied {
                Some(raw) => (param.coerce)(raw.clone()).map_err(|source| CommandError::Argument {
                    param: param.info.name.to_string(),
                    source,
                })?,
                None => (param.fallback)(),
            };
            values.push(Some(value));
        }

        Ok(Arguments { values })
    }
}

fn lookup_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    args.get(name).or_else(|| {
        args.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Commands of one registered node, bound to that node instance.
pub struct CommandTable {
    node_id: String,
    commands: HashMap<&'static str, BoundCommand>,
}

impl CommandTable {
    pub fn bind<VM: ViewModel>(node: &SyncNode<VM>) -> Self {
        let mut commands = HashMap::new();

        for descriptor in VM::commands() {
            let signature = descriptor.signature();
            let handler = descriptor.handler;
            let target = node.clone();

            let bound = BoundCommand {
                signature,
                params: descriptor.params,
                invoke: Box::new(move |args: &mut Arguments| handler(&target, args)),
            };

            if commands.insert(descriptor.name, bound).is_some() {
                tracing::warn!(
                    node = node.id(),
                    command = descriptor.name,
                    "duplicate command declaration; keeping the last one"
                );
            }
        }

        Self {
            node_id: node.id().to_string(),
            commands,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn signature(&self, method: &str) -> Option<&CommandSignature> {
        self.find(method).map(|command| &command.signature)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &CommandSignature> {
        self.commands.values().map(|command| &command.signature)
    }

    fn find(&self, method: &str) -> Option<&BoundCommand> {
        self.commands.get(method).or_else(|| {
            self.commands
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(method))
                .map(|(_, command)| command)
        })
    }

    /// Resolves and coerces every argument, then runs the handler. No
    /// handler runs unless every supplied argument converts. Returns
    /// `Ok(None)` for commands without a return value.
    pub fn invoke(&self, method: &str, args: Option<&Value>) -> Result<Option<Value>, CommandError> {
        let command = self.find(method).ok_or_else(|| CommandError::NotFound {
            node: self.node_id.clone(),
            method: method.to_string(),
        })?;

        let mut arguments = command.resolve(args.and_then(Value::as_object))?;

        match panic::catch_unwind(AssertUnwindSafe(|| (command.invoke)(&mut arguments))) {
            Ok(result) => result,
            Err(payload) => Err(CommandError::Panicked(panic_message(payload))),
        }
    }
}
