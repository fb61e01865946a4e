pub mod channels;
pub mod command;
pub mod config;
pub mod error;
pub mod node;
pub mod observable;
pub mod protocol;
pub mod registry;
pub mod schema;

use crate::protocol::{Outbox, reader_loop, writer_loop};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub use crate::channels::{FloatChannel, ImageResponse, ImageSource, resolve_image_request};
pub use crate::command::{Arguments, CommandDescriptor, CommandSignature, CommandTable, ParamInfo};
pub use crate::config::BridgeConfig;
pub use crate::error::{CommandError, FieldError, ProtocolError, RegistryError};
pub use crate::node::SyncNode;
pub use crate::observable::{
    Change, ItemsAction, ItemsChanged, ObjectId, Observable, ObservableList, Reach, SubscriptionId,
    WatchHandle, Watchable,
};
pub use crate::protocol::{InboundEnvelope, OutboundEnvelope, OutboundMessage, RequestId};
pub use crate::registry::Registry;
pub use crate::schema::{FieldDescriptor, ViewModel};
pub use serde_json;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub trait HostBindings {
    /// Registers the host's view-models. Runs on the owning thread before
    /// any frame is read.
    fn register(registry: &mut Registry) -> Result<(), RegistryError>;

    /// Runs once after the initial snapshot is queued. Background producers
    /// started here reach the owning thread through `handle`.
    fn start(_registry: &mut Registry, _handle: LoopHandle) {}
}

type Task = Box<dyn FnOnce(&Registry) + Send>;

enum LoopEvent {
    Frame(Vec<u8>),
    Invoke(Task),
    Closed,
}

/// Marshals work from other threads onto the owning thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: SyncSender<LoopEvent>,
    closed: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Queues `task` behind any frames already received. Returns `false`
    /// once the loop has stopped.
    pub fn invoke<F>(&self, task: F) -> bool
    where
        F: FnOnce(&Registry) + Send + 'static,
    {
        if self.is_closed() {
            return false;
        }
        self.tx.send(LoopEvent::Invoke(Box::new(task))).is_ok()
    }

    /// Producers poll this to stop once the UI connection is gone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Serves one UI connection over `reader`/`writer` until the reader
/// reaches EOF. All node state stays on the calling thread.
pub fn run<B, R, W>(config: BridgeConfig, reader: R, writer: W) -> Result<(), Box<dyn std::error::Error>>
where
    B: HostBindings,
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::sync_channel(config.inbound_queue_cap);

    let mut registry = Registry::new(Outbox::with_notice_cap(outbound_tx, config.outbound_notice_cap));
    B::register(&mut registry)?;

    let outbound_frame_cap = config.outbound_frame_cap;
    let writer_handle = thread::spawn(move || writer_loop(outbound_rx, writer, outbound_frame_cap));

    registry.send_full_state();

    let closed = Arc::new(AtomicBool::new(false));
    B::start(
        &mut registry,
        LoopHandle {
            tx: event_tx.clone(),
            closed: closed.clone(),
        },
    );

    let inbound_frame_cap = config.inbound_frame_cap;
    let reader_handle = thread::spawn(move || {
        let read_result = reader_loop(reader, inbound_frame_cap, |payload| {
            event_tx.send(LoopEvent::Frame(payload)).is_ok()
        });

        if let Err(err) = &read_result {
            tracing::warn!("reader loop terminated with error: {err}");
        }

        let _ = event_tx.send(LoopEvent::Closed);
        read_result
    });

    for event in event_rx.iter() {
        match event {
            LoopEvent::Frame(payload) => registry.dispatch(&payload),
            LoopEvent::Invoke(task) => task(&registry),
            LoopEvent::Closed => break,
        }
    }

    // Producers release their outbox clones once they see the flag, which
    // lets the writer drain and exit.
    closed.store(true, Ordering::Release);
    drop(event_rx);
    drop(registry);

    join_thread("reader", reader_handle, SHUTDOWN_GRACE);
    join_thread("writer", writer_handle, SHUTDOWN_GRACE);

    Ok(())
}

fn join_thread(name: &str, handle: JoinHandle<io::Result<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    if handle.is_finished() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(thread = name, "thread returned error: {err}"),
            Err(err) => tracing::warn!(thread = name, "thread join failed: {err:?}"),
        }
    } else {
        // Avoid hanging process exit on blocked stdio during teardown.
        tracing::warn!(thread = name, "thread still active during shutdown; skipping join");
    }
}
