//! Side channels that bypass the observable graph: a fixed-capacity float
//! buffer with readiness notices, and per-channel image resources.

use crate::protocol::{BufferHandlePayload, OutboundEnvelope, Outbox, SHARED_MEM_READY};
use std::sync::{Arc, Mutex};

/// Host of the conventional image resource URLs.
pub const IMAGE_HOST: &str = "hybrid.vision";

/// Fixed-capacity `f32` buffer delivered to the UI by handle. Safe to share
/// with producer threads.
#[derive(Debug, Clone)]
pub struct FloatChannel {
    name: Arc<str>,
    capacity: usize,
    buffer: Arc<Mutex<Vec<f32>>>,
    outbox: Outbox,
}

impl FloatChannel {
    pub fn new(name: impl Into<String>, capacity: usize, outbox: Outbox) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            capacity,
            buffer: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            outbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores up to `capacity` values and emits the readiness notice. The
    /// notice is dropped when the UI has fallen behind; the buffer is still
    /// updated. Returns the number of values stored.
    pub fn publish(&self, data: &[f32]) -> usize {
        let count = data.len().min(self.capacity);
        if count < data.len() {
            tracing::debug!(
                channel = %self.name,
                dropped = data.len() - count,
                "float channel publish truncated to capacity"
            );
        }

        {
            let Ok(mut buffer) = self.buffer.lock() else {
                tracing::warn!(channel = %self.name, "float channel buffer poisoned; publish skipped");
                return 0;
            };
            buffer.clear();
            buffer.extend_from_slice(&data[..count]);
        }

        self.outbox
            .send_notice(format!("{SHARED_MEM_READY}:{}:{count}", self.name));
        count
    }

    /// Re-delivers the buffer handle.
    pub fn post_handle(&self) {
        let element_count = self.buffer.lock().map(|buffer| buffer.len()).unwrap_or(0);

        self.outbox.send(OutboundEnvelope::BufferHandle {
            payload: BufferHandlePayload {
                channel_name: self.name.to_string(),
                capacity: self.capacity,
                element_count,
            },
        });
    }

    pub fn snapshot(&self) -> Vec<f32> {
        match self.buffer.lock() {
            Ok(buffer) => buffer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Supplies encoded image frames by channel name.
pub trait ImageSource {
    fn frame(&self, channel: &str) -> Option<Vec<u8>>;
}

impl<F> ImageSource for F
where
    F: Fn(&str) -> Option<Vec<u8>>,
{
    fn frame(&self, channel: &str) -> Option<Vec<u8>> {
        self(channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl ImageResponse {
    fn found(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: Some("image/jpeg"),
            body,
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }
    }
}

/// Answers `http://hybrid.vision/<channel>`. Returns `None` for URLs on any
/// other host so the caller can let them through untouched.
pub fn resolve_image_request(source: &impl ImageSource, url: &str) -> Option<ImageResponse> {
    let channel = image_channel(url)?;
    Some(match source.frame(channel) {
        Some(body) => ImageResponse::found(body),
        None => ImageResponse::not_found(),
    })
}

fn image_channel(url: &str) -> Option<&str> {
    let (_scheme, rest) = url.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };

    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if !host.eq_ignore_ascii_case(IMAGE_HOST) {
        return None;
    }

    let path = path.split(['?', '#']).next().unwrap_or(path);
    Some(path.trim_matches('/'))
}
