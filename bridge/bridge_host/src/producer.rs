use crate::view_models::{VISION_VM, VisionVm};
use bridge_runtime::{FloatChannel, LoopHandle};
use std::thread;
use std::time::{Duration, Instant};

pub const SINE_CHANNEL: &str = "sine-wave";
pub const DEFAULT_SINE_CAPACITY: usize = 1024;
pub const DEFAULT_SINE_INTERVAL_MS: usize = 16;

/// Frames between `framesPublished` updates.
const FRAMES_PER_SYNC: u64 = 60;

/// Fills `data` with the demo waveform at `time` seconds.
pub fn fill_sine(data: &mut [f32], time: f64) {
    for (index, sample) in data.iter_mut().enumerate() {
        *sample = (time * 10.0 + index as f64 * 0.1).sin() as f32;
    }
}

/// Publishes a waveform every `interval` until the loop closes. Never
/// touches view-model state directly; counter updates are marshalled
/// through `handle`.
pub fn spawn_sine_producer(channel: FloatChannel, handle: LoopHandle, interval: Duration) {
    let spawned = thread::Builder::new()
        .name("sine-producer".to_string())
        .spawn(move || run_sine_producer(channel, handle, interval));

    if let Err(err) = spawned {
        tracing::warn!("failed to start sine producer: {err}");
    }
}

fn run_sine_producer(channel: FloatChannel, handle: LoopHandle, interval: Duration) {
    let started = Instant::now();
    let mut data = vec![0.0_f32; channel.capacity()];
    let mut frames: u64 = 0;

    while !handle.is_closed() {
        fill_sine(&mut data, started.elapsed().as_secs_f64());
        channel.publish(&data);
        frames += 1;

        if frames % FRAMES_PER_SYNC == 0 {
            let published = frames;
            let delivered = handle.invoke(move |registry| {
                if let Some(node) = registry.node::<VisionVm>(VISION_VM) {
                    node.set_field("framesPublished", |vm| &mut vm.frames_published, published);
                }
            });
            if !delivered {
                break;
            }
        }

        thread::sleep(interval);
    }

    tracing::debug!(channel = channel.name(), frames, "sine producer stopped");
}
