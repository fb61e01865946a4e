use crate::channels::FloatChannel;
use crate::command::{CommandSignature, CommandTable};
use crate::error::{CommandError, RegistryError};
use crate::node::{StateSink, SyncNode};
use crate::protocol::{
    CommandPayload, InboundEnvelope, OutboundEnvelope, Outbox, RequestId, StatePayload,
    command_failure_envelope, command_success_envelope, decode_inbound, state_sync_envelope,
};
use crate::schema::ViewModel;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Type-erased view of a registered node.
trait NodeEntry {
    fn snapshot(&self) -> Map<String, Value>;
    fn set_field_by_name(&self, name: &str, value: Value) -> bool;
    fn detach(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<VM: ViewModel> NodeEntry for SyncNode<VM> {
    fn snapshot(&self) -> Map<String, Value> {
        SyncNode::snapshot(self)
    }

    fn set_field_by_name(&self, name: &str, value: Value) -> bool {
        SyncNode::set_field_by_name(self, name, value)
    }

    fn detach(&self) {
        SyncNode::detach(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Owns every registered node, their command tables and the outbound queue.
/// Lives on the owning thread.
pub struct Registry {
    nodes: BTreeMap<String, Box<dyn NodeEntry>>,
    commands: HashMap<String, CommandTable>,
    channels: HashMap<String, FloatChannel>,
    outbox: Outbox,
}

impl Registry {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            nodes: BTreeMap::new(),
            commands: HashMap::new(),
            channels: HashMap::new(),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Attaches `node` to the outbound queue and binds its commands. A
    /// duplicate id leaves the existing registration untouched.
    pub fn register<VM: ViewModel>(&mut self, node: SyncNode<VM>) -> Result<(), RegistryError> {
        let id = node.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(RegistryError::DuplicateNode(id));
        }

        let outbox = self.outbox.clone();
        let sink: StateSink = Rc::new(move |vm_name: &str, prop_name: &str, value: Value| {
            outbox.send(state_sync_envelope(vm_name, prop_name, value));
        });
        node.attach(sink);

        let table = CommandTable::bind(&node);
        tracing::info!(
            node = %id,
            fields = node.field_names().count(),
            commands = table.len(),
            "registered view-model"
        );

        if !table.is_empty() {
            self.commands.insert(id.clone(), table);
        }
        self.nodes.insert(id, Box::new(node));
        Ok(())
    }

    /// Detaches and forgets a node. Returns `false` for an unknown id.
    pub fn unregister(&mut self, id: &str) -> bool {
        self.commands.remove(id);
        match self.nodes.remove(id) {
            Some(node) => {
                node.detach();
                true
            }
            None => false,
        }
    }

    pub fn node<VM: ViewModel>(&self, id: &str) -> Option<SyncNode<VM>> {
        self.nodes
            .get(id)
            .and_then(|node| node.as_any().downcast_ref::<SyncNode<VM>>())
            .cloned()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Command metadata for every node, keyed by node id.
    pub fn command_signatures(&self) -> BTreeMap<&str, Vec<&CommandSignature>> {
        self.commands
            .iter()
            .map(|(id, table)| {
                let mut signatures: Vec<&CommandSignature> = table.signatures().collect();
                signatures.sort_by_key(|signature| signature.name);
                (id.as_str(), signatures)
            })
            .collect()
    }

    pub fn add_float_channel(&mut self, channel: FloatChannel) {
        if self
            .channels
            .insert(channel.name().to_string(), channel)
            .is_some()
        {
            tracing::warn!("float channel replaced by a later registration");
        }
    }

    /// Current value of every synced field across every node.
    pub fn full_state(&self) -> Map<String, Value> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), Value::Object(node.snapshot())))
            .collect()
    }

    pub fn send_full_state(&self) {
        self.outbox.send(OutboundEnvelope::InitResponse {
            state: self.full_state(),
        });
    }

    /// Routes one inbound frame body. Nothing arriving from the wire can
    /// make this fail; faults are logged and the message dropped.
    pub fn dispatch(&self, payload: &[u8]) {
        let envelope = match decode_inbound(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("inbound message dropped: {err}");
                return;
            }
        };

        match envelope {
            InboundEnvelope::StateSet { payload } => self.process_state_set(payload),
            InboundEnvelope::InitRequest => self.send_full_state(),
            InboundEnvelope::Command { payload } => self.process_command(payload),
            InboundEnvelope::RequestBufferHandle { channel_name } => {
                self.process_buffer_request(channel_name.as_deref())
            }
        }
    }

    fn process_state_set(&self, payload: StatePayload) {
        let StatePayload {
            vm_name,
            prop_name,
            value,
        } = payload;

        match self.nodes.get(&vm_name) {
            Some(node) => {
                node.set_field_by_name(&prop_name, value);
            }
            None => tracing::warn!(node = %vm_name, field = %prop_name, "state set for unknown view-model"),
        }
    }

    fn process_command(&self, payload: CommandPayload) {
        let CommandPayload {
            vm_name,
            method_name,
            args,
            request_id,
        } = payload;

        let outcome = match self.commands.get(&vm_name) {
            Some(table) if self.nodes.contains_key(&vm_name) => table.invoke(&method_name, args.as_ref()),
            _ => Err(CommandError::NotFound {
                node: vm_name.clone(),
                method: method_name.clone(),
            }),
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(node = %vm_name, method = %method_name, "command invoked");
                if let (Some(result), Some(request_id)) = (result, request_id) {
                    tracing::debug!(request_id = %request_id, "command result sent");
                    self.outbox.send(command_success_envelope(request_id, Some(result)));
                }
            }
            Err(err) => {
                tracing::warn!(node = %vm_name, method = %method_name, "command failed: {err}");
                self.respond_failure(request_id, &err);
            }
        }
    }

    fn respond_failure(&self, request_id: Option<RequestId>, err: &CommandError) {
        if let Some(request_id) = request_id {
            tracing::debug!(request_id = %request_id, "command failure sent");
            self.outbox.send(command_failure_envelope(request_id, err.to_string()));
        }
    }

    fn process_buffer_request(&self, channel_name: Option<&str>) {
        let Some(name) = channel_name else {
            tracing::warn!("buffer handle request without a channel name");
            return;
        };

        match self.channels.get(name) {
            Some(channel) => channel.post_handle(),
            None => tracing::warn!(channel = name, "buffer handle requested for unknown channel"),
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandDescriptor;
    use crate::protocol::OutboundMessage;
    use crate::schema::FieldDescriptor;
    use serde_json::json;
    use std::sync::mpsc;

    struct Lamp {
        brightness: u8,
        label: String,
    }

    impl ViewModel for Lamp {
        fn fields() -> Vec<FieldDescriptor<Self>> {
            vec![
                FieldDescriptor::new(
                    "brightness",
                    |vm: &Lamp| &vm.brightness,
                    |vm: &mut Lamp| &mut vm.brightness,
                ),
                FieldDescriptor::read_only("label", |vm: &Lamp| &vm.label),
            ]
        }

        fn commands() -> Vec<CommandDescriptor<Self>> {
            vec![
                CommandDescriptor::<Self>::new("describe").returns(|node: &SyncNode<Lamp>, _args| {
                    Ok(node.read(|vm| format!("{} at {}", vm.label, vm.brightness)))
                }),
                CommandDescriptor::<Self>::new("dim")
                    .param_or::<u8>("step", 5)
                    .action(|node: &SyncNode<Lamp>, args| {
                        let step: u8 = args.take(0)?;
                        let next = node.read(|vm| vm.brightness.saturating_sub(step));
                        node.set_field("brightness", |vm| &mut vm.brightness, next);
                        Ok(())
                    }),
            ]
        }
    }

    fn lamp(label: &str) -> SyncNode<Lamp> {
        SyncNode::new(
            "Lamp",
            Lamp {
                brightness: 10,
                label: label.to_string(),
            },
        )
    }

    fn registry() -> (Registry, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel();
        let mut registry = Registry::new(Outbox::new(tx));
        registry.register(lamp("desk")).expect("register");
        (registry, rx)
    }

    fn drain(rx: &mpsc::Receiver<OutboundMessage>) -> Vec<Value> {
        rx.try_iter()
            .map(|message| match message {
                OutboundMessage::Envelope(envelope) => serde_json::to_value(envelope).expect("encode"),
                OutboundMessage::Notice(notice) => Value::String(notice.text().to_string()),
            })
            .collect()
    }

    #[test]
    fn duplicate_registration_keeps_existing_node() {
        let (mut registry, _rx) = registry();

        let err = registry.register(lamp("imposter")).expect_err("duplicate");
        assert!(matches!(err, RegistryError::DuplicateNode(id) if id == "Lamp"));

        let node = registry.node::<Lamp>("Lamp").expect("typed lookup");
        assert_eq!(node.read(|vm| vm.label.clone()), "desk");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn local_writes_become_state_sync() {
        let (registry, rx) = registry();
        let node = registry.node::<Lamp>("Lamp").expect("node");

        node.set_field("brightness", |vm| &mut vm.brightness, 80);

        assert_eq!(
            drain(&rx),
            vec![json!({"type": "STATE_SYNC", "payload": {"vmName": "Lamp", "propName": "brightness", "value": 80}})]
        );
    }

    #[test]
    fn state_set_applies_without_echo() {
        let (registry, rx) = registry();

        registry.dispatch(br#"{"type":"STATE_SET","payload":{"vmName":"Lamp","propName":"Brightness","value":42}}"#);

        let node = registry.node::<Lamp>("Lamp").expect("node");
        assert_eq!(node.read(|vm| vm.brightness), 42);
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn init_request_returns_current_snapshot() {
        let (registry, rx) = registry();
        registry
            .node::<Lamp>("Lamp")
            .expect("node")
            .set_field("brightness", |vm| &mut vm.brightness, 99);
        let _ = drain(&rx);

        registry.dispatch(br#"{"type":"INIT_REQUEST"}"#);

        assert_eq!(
            drain(&rx),
            vec![json!({"type": "INIT_RESPONSE", "state": {"Lamp": {"brightness": 99, "label": "desk"}}})]
        );
    }

    #[test]
    fn command_response_only_with_request_id() {
        let (registry, rx) = registry();

        registry.dispatch(br#"{"type":"COMMAND","payload":{"vmName":"Lamp","methodName":"describe"}}"#);
        assert!(drain(&rx).is_empty());

        registry.dispatch(br#"{"type":"COMMAND","payload":{"vmName":"Lamp","methodName":"describe","requestId":"r-9"}}"#);
        assert_eq!(
            drain(&rx),
            vec![json!({"type": "COMMAND_RESPONSE", "payload": {"requestId": "r-9", "success": true, "result": "desk at 10"}})]
        );
    }

    #[test]
    fn unknown_targets_fail_when_correlated() {
        let (registry, rx) = registry();

        registry.dispatch(br#"{"type":"COMMAND","payload":{"vmName":"Lamp","methodName":"explode","requestId":1}}"#);
        registry.dispatch(br#"{"type":"COMMAND","payload":{"vmName":"Ghost","methodName":"describe","requestId":2}}"#);
        registry.dispatch(br#"{"type":"COMMAND","payload":{"vmName":"Ghost","methodName":"describe"}}"#);

        let responses = drain(&rx);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["payload"]["requestId"], json!(1));
        assert_eq!(responses[0]["payload"]["success"], json!(false));
        assert_eq!(responses[0]["payload"]["error"], json!("Command not found: Lamp.explode"));
        assert_eq!(responses[1]["payload"]["error"], json!("Command not found: Ghost.describe"));
    }

    #[test]
    fn bad_messages_are_dropped() {
        let (registry, rx) = registry();

        registry.dispatch(b"not json");
        registry.dispatch(br#"{"type":"SHUTDOWN"}"#);
        registry.dispatch(br#"{"payload":{}}"#);
        registry.dispatch(br#"{"type":"STATE_SET","payload":{"vmName":"Ghost","propName":"x","value":1}}"#);
        registry.dispatch(br#"{"type":"STATE_SET","payload":{"vmName":"Lamp","propName":"label","value":"hall"}}"#);
        registry.dispatch(br#"{"type":"REQUEST_BUFFER_HANDLE","channelName":"nope"}"#);

        assert!(drain(&rx).is_empty());
        let node = registry.node::<Lamp>("Lamp").expect("node");
        assert_eq!(node.read(|vm| vm.label.clone()), "desk");
    }

    #[test]
    fn buffer_requests_route_to_named_channel() {
        let (mut registry, rx) = registry();
        let channel = FloatChannel::new("sine-wave", 4, registry.outbox().clone());
        registry.add_float_channel(channel);

        registry.dispatch(br#"{"type":"REQUEST_BUFFER_HANDLE","channelName":"sine-wave"}"#);

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], json!("BUFFER_HANDLE"));
        assert_eq!(messages[0]["payload"]["channelName"], json!("sine-wave"));
    }

    #[test]
    fn command_signatures_list_each_node_sorted_by_name() {
        let (registry, _rx) = registry();

        let signatures = registry.command_signatures();
        let lamp = signatures.get("Lamp").expect("lamp commands");
        let names: Vec<&str> = lamp.iter().map(|signature| signature.name).collect();
        assert_eq!(names, vec!["describe", "dim"]);

        assert!(lamp[0].returns_value);
        assert!(lamp[0].params.is_empty());
        assert!(!lamp[1].returns_value);
        assert_eq!(lamp[1].params[0].name, "step");
        assert_eq!(lamp[1].params[0].default, Some(json!(5)));

        assert_eq!(
            serde_json::to_value(lamp[1]).expect("encode"),
            json!({
                "name": "dim",
                "params": [{"name": "step", "typeName": "u8", "default": 5}],
                "returnsValue": false
            })
        );
    }

    #[test]
    fn typed_lookup_rejects_wrong_type() {
        struct Other;
        impl ViewModel for Other {
            fn fields() -> Vec<FieldDescriptor<Self>> {
                Vec::new()
            }
        }

        let (registry, _rx) = registry();
        assert!(registry.node::<Other>("Lamp").is_none());
        assert!(registry.node::<Lamp>("Missing").is_none());
    }

    #[test]
    fn unregister_detaches_node() {
        let (mut registry, rx) = registry();
        let node = registry.node::<Lamp>("Lamp").expect("node");

        assert!(registry.unregister("Lamp"));
        assert!(!registry.unregister("Lamp"));
        node.set_field("brightness", |vm| &mut vm.brightness, 1);
        assert!(drain(&rx).is_empty());
        assert!(registry.command_signatures().is_empty());
    }
}
