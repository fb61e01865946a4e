use bridge_runtime::{
    CommandDescriptor, FieldDescriptor, Observable, ObservableList, Reach, SyncNode, ViewModel,
    WatchHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const VISION_VM: &str = "VisionVM";
pub const COMPLEX_VM: &str = "ComplexVM";

/// Camera control: exposure, gain and the processing switch.
#[derive(Debug)]
pub struct VisionVm {
    pub exposure: i32,
    pub gain: f64,
    pub is_running: bool,
    pub frames_published: u64,
}

impl Default for VisionVm {
    fn default() -> Self {
        Self {
            exposure: 10,
            gain: 1.0,
            is_running: false,
            frames_published: 0,
        }
    }
}

impl VisionVm {
    pub fn status_summary(&self, prefix: &str) -> String {
        format!(
            "{prefix}: Exposure={}, Gain={}, IsRunning={}",
            self.exposure, self.gain, self.is_running
        )
    }
}

impl ViewModel for VisionVm {
    fn fields() -> Vec<FieldDescriptor<Self>> {
        vec![
            FieldDescriptor::new(
                "exposure",
                |vm: &VisionVm| &vm.exposure,
                |vm: &mut VisionVm| &mut vm.exposure,
            ),
            FieldDescriptor::new("gain", |vm: &VisionVm| &vm.gain, |vm: &mut VisionVm| &mut vm.gain),
            FieldDescriptor::new(
                "isRunning",
                |vm: &VisionVm| &vm.is_running,
                |vm: &mut VisionVm| &mut vm.is_running,
            ),
            FieldDescriptor::read_only("framesPublished", |vm: &VisionVm| &vm.frames_published),
        ]
    }

    fn commands() -> Vec<CommandDescriptor<Self>> {
        vec![
            CommandDescriptor::<Self>::new("toggleRunning")
                .param::<String>("reason")
                .action(|node, args| {
                    let reason: String = args.take(0)?;
                    let running = !node.read(|vm| vm.is_running);
                    node.set_field("isRunning", |vm| &mut vm.is_running, running);
                    tracing::info!(reason = %reason, is_running = running, "toggleRunning");
                    Ok(())
                }),
            CommandDescriptor::<Self>::new("getStatusSummary")
                .param::<String>("prefix")
                .returns(|node, args| {
                    let prefix: String = args.take(0)?;
                    Ok(node.read(|vm| vm.status_summary(&prefix)))
                }),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraParams {
    pub resolution_x: f64,
    pub resolution_y: f64,
    pub supported_modes: Vec<String>,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            resolution_x: 1920.0,
            resolution_y: 1080.0,
            supported_modes: vec!["Standard".to_string(), "HighSpeed".to_string(), "HDR".to_string()],
        }
    }
}

impl Reach for CameraParams {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub model_name: String,
    pub internal_camera: Observable<CameraParams>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            model_name: "Hybrid-X1".to_string(),
            internal_camera: Observable::default(),
        }
    }
}

impl Reach for DeviceConfig {
    fn reach(&self, out: &mut Vec<WatchHandle>) {
        self.internal_camera.reach(out);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub message: String,
    pub level: String,
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            message: String::new(),
            level: "Info".to_string(),
        }
    }
}

impl Reach for LogEntry {}

/// Nested configuration, a status dictionary and a live log list.
#[derive(Debug)]
pub struct ComplexVm {
    pub config: Observable<DeviceConfig>,
    pub status_info: BTreeMap<String, String>,
    pub logs: ObservableList<Observable<LogEntry>>,
}

impl Default for ComplexVm {
    fn default() -> Self {
        let status_info = [("System", "Ready"), ("Connection", "Stable")]
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        Self {
            config: Observable::default(),
            status_info,
            logs: ObservableList::new(),
        }
    }
}

impl ViewModel for ComplexVm {
    fn fields() -> Vec<FieldDescriptor<Self>> {
        vec![
            FieldDescriptor::new(
                "config",
                |vm: &ComplexVm| &vm.config,
                |vm: &mut ComplexVm| &mut vm.config,
            ),
            FieldDescriptor::new(
                "statusInfo",
                |vm: &ComplexVm| &vm.status_info,
                |vm: &mut ComplexVm| &mut vm.status_info,
            ),
            FieldDescriptor::new("logs", |vm: &ComplexVm| &vm.logs, |vm: &mut ComplexVm| &mut vm.logs),
        ]
    }

    fn commands() -> Vec<CommandDescriptor<Self>> {
        vec![
            CommandDescriptor::<Self>::new("addLog")
                .param::<String>("message")
                .param_or::<String>("level", "Info".to_string())
                .action(|node: &SyncNode<ComplexVm>, args| {
                    let message: String = args.take(0)?;
                    let level: String = args.take(1)?;
                    let logs = node.read(|vm| vm.logs.clone());
                    logs.push(Observable::new(LogEntry { message, level }));
                    Ok(())
                }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_runtime::{CommandTable, Registry, protocol::Outbox, protocol::OutboundMessage};
    use serde_json::{Value, json};
    use std::sync::mpsc;

    fn registry() -> (Registry, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel();
        let mut registry = Registry::new(Outbox::new(tx));
        registry
            .register(SyncNode::new(VISION_VM, VisionVm::default()))
            .expect("register vision");
        registry
            .register(SyncNode::new(COMPLEX_VM, ComplexVm::default()))
            .expect("register complex");
        (registry, rx)
    }

    fn drain(rx: &mpsc::Receiver<OutboundMessage>) -> Vec<Value> {
        rx.try_iter()
            .filter_map(|message| match message {
                OutboundMessage::Envelope(envelope) => serde_json::to_value(envelope).ok(),
                OutboundMessage::Notice(_) => None,
            })
            .collect()
    }

    #[test]
    fn initial_state_matches_defaults() {
        let (registry, _rx) = registry();
        let state = registry.full_state();

        assert_eq!(
            state[VISION_VM],
            json!({"exposure": 10, "gain": 1.0, "isRunning": false, "framesPublished": 0})
        );
        assert_eq!(
            state[COMPLEX_VM]["config"],
            json!({
                "modelName": "Hybrid-X1",
                "internalCamera": {
                    "resolutionX": 1920.0,
                    "resolutionY": 1080.0,
                    "supportedModes": ["Standard", "HighSpeed", "HDR"]
                }
            })
        );
        assert_eq!(state[COMPLEX_VM]["statusInfo"], json!({"Connection": "Stable", "System": "Ready"}));
        assert_eq!(state[COMPLEX_VM]["logs"], json!([]));
    }

    #[test]
    fn toggle_running_pushes_flag() {
        let (registry, rx) = registry();

        registry.dispatch(
            br#"{"type":"COMMAND","payload":{"vmName":"VisionVM","methodName":"toggleRunning","args":{"reason":"test"}}}"#,
        );

        let node = registry.node::<VisionVm>(VISION_VM).expect("vision");
        assert!(node.read(|vm| vm.is_running));
        assert_eq!(drain(&rx)[0]["payload"]["propName"], json!("isRunning"));
    }

    #[test]
    fn status_summary_reflects_current_values() {
        let node = SyncNode::new(VISION_VM, VisionVm::default());
        node.set_field("exposure", |vm| &mut vm.exposure, 50);
        let table = CommandTable::bind(&node);

        let summary = table
            .invoke("getStatusSummary", Some(&json!({"prefix": "Now"})))
            .expect("invoke");
        assert_eq!(summary, Some(json!("Now: Exposure=50, Gain=1, IsRunning=false")));
    }

    #[test]
    fn add_log_defaults_level_and_reports_under_logs() {
        let (registry, rx) = registry();

        registry.dispatch(
            br#"{"type":"COMMAND","payload":{"vmName":"ComplexVM","methodName":"addLog","args":{"message":"booted"}}}"#,
        );

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["payload"]["propName"], json!("logs"));
        assert_eq!(messages[0]["payload"]["value"], json!([{"message": "booted", "level": "Info"}]));

        let node = registry.node::<ComplexVm>(COMPLEX_VM).expect("complex");
        let entry = node.read(|vm| vm.logs.get(0)).expect("entry");
        entry.set("level", |e| &mut e.level, "Warn".to_string());

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["payload"]["value"][0]["level"], json!("Warn"));
    }

    #[test]
    fn nested_camera_change_reports_config() {
        let (registry, rx) = registry();
        let node = registry.node::<ComplexVm>(COMPLEX_VM).expect("complex");

        let camera = node.read(|vm| vm.config.read(|c| c.internal_camera.clone()));
        camera.set("resolutionX", |c| &mut c.resolution_x, 3840.0);

        let messages = drain(&rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["payload"]["propName"], json!("config"));
        assert_eq!(messages[0]["payload"]["value"]["internalCamera"]["resolutionX"], json!(3840.0));
    }
}
