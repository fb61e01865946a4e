mod producer;
mod view_models;

use crate::producer::{
    DEFAULT_SINE_CAPACITY, DEFAULT_SINE_INTERVAL_MS, SINE_CHANNEL, spawn_sine_producer,
};
use crate::view_models::{COMPLEX_VM, ComplexVm, VISION_VM, VisionVm};
use bridge_runtime::config::parse_capacity;
use bridge_runtime::{
    BridgeConfig, FloatChannel, HostBindings, LoopHandle, Registry, RegistryError, SyncNode,
};
use std::io;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BRIDGE_LOG";
const SINE_CAPACITY_VAR: &str = "BRIDGE_SINE_CAPACITY";
const SINE_INTERVAL_VAR: &str = "BRIDGE_SINE_INTERVAL_MS";

struct DemoBindings;

impl HostBindings for DemoBindings {
    fn register(registry: &mut Registry) -> Result<(), RegistryError> {
        registry.register(SyncNode::new(VISION_VM, VisionVm::default()))?;
        registry.register(SyncNode::new(COMPLEX_VM, ComplexVm::default()))?;
        Ok(())
    }

    fn start(registry: &mut Registry, handle: LoopHandle) {
        let lookup = |key: &str| std::env::var(key).ok();
        let capacity = parse_capacity(lookup, SINE_CAPACITY_VAR, DEFAULT_SINE_CAPACITY);
        let interval_ms = parse_capacity(lookup, SINE_INTERVAL_VAR, DEFAULT_SINE_INTERVAL_MS);

        let channel = FloatChannel::new(SINE_CHANNEL, capacity, registry.outbox().clone());
        registry.add_float_channel(channel.clone());
        channel.post_handle();

        spawn_sine_producer(channel, handle, Duration::from_millis(interval_ms as u64));
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run() {
        tracing::error!("bridge_host fatal error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::from_env();
    tracing::info!(?config, "bridge host starting on stdio");

    bridge_runtime::run::<DemoBindings, _, _>(config, io::stdin(), io::stdout())
}
