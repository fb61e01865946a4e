use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};

pub const DEFAULT_INBOUND_FRAME_CAP: usize = 1_048_576;
pub const DEFAULT_OUTBOUND_FRAME_CAP: usize = 16_777_216;
/// Readiness notices allowed in the outbound queue at once.
pub const DEFAULT_OUTBOUND_NOTICE_CAP: usize = 64;

/// Prefix of the plain-text readiness notice for float channels.
pub const SHARED_MEM_READY: &str = "SHARED_MEM_READY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePayload {
    pub vm_name: String,
    pub prop_name: String,
    #[serde(default)]
    pub value: Value,
}

/// Correlation id supplied by the UI, echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub vm_name: String,
    pub method_name: String,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponsePayload {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferHandlePayload {
    pub channel_name: String,
    pub capacity: usize,
    pub element_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    #[serde(rename = "STATE_SYNC")]
    StateSync { payload: StatePayload },

    #[serde(rename = "INIT_RESPONSE")]
    InitResponse { state: Map<String, Value> },

    #[serde(rename = "COMMAND_RESPONSE")]
    CommandResponse { payload: CommandResponsePayload },

    #[serde(rename = "BUFFER_HANDLE")]
    BufferHandle { payload: BufferHandlePayload },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEnvelope {
    #[serde(rename = "STATE_SET")]
    StateSet { payload: StatePayload },

    #[serde(rename = "INIT_REQUEST")]
    InitRequest,

    #[serde(rename = "COMMAND")]
    Command { payload: CommandPayload },

    #[serde(rename = "REQUEST_BUFFER_HANDLE")]
    RequestBufferHandle {
        #[serde(rename = "channelName", default)]
        channel_name: Option<String>,
    },
}

const INBOUND_KINDS: [&str; 4] = ["STATE_SET", "INIT_REQUEST", "COMMAND", "REQUEST_BUFFER_HANDLE"];

pub fn state_sync_envelope(vm_name: &str, prop_name: &str, value: Value) -> OutboundEnvelope {
    OutboundEnvelope::StateSync {
        payload: StatePayload {
            vm_name: vm_name.to_string(),
            prop_name: prop_name.to_string(),
            value,
        },
    }
}

pub fn command_success_envelope(request_id: RequestId, result: Option<Value>) -> OutboundEnvelope {
    OutboundEnvelope::CommandResponse {
        payload: CommandResponsePayload {
            request_id,
            success: true,
            result,
            error: None,
        },
    }
}

pub fn command_failure_envelope(request_id: RequestId, error: impl Into<String>) -> OutboundEnvelope {
    OutboundEnvelope::CommandResponse {
        payload: CommandResponsePayload {
            request_id,
            success: false,
            result: None,
            error: Some(error.into()),
        },
    }
}

/// Decodes one inbound frame body, distinguishing a missing or unknown
/// `type` from a known kind with a bad payload.
pub fn decode_inbound(payload: &[u8]) -> Result<InboundEnvelope, ProtocolError> {
    let raw: Value = serde_json::from_slice(payload).map_err(ProtocolError::InvalidJson)?;

    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !INBOUND_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownKind(kind));
    }

    serde_json::from_value(raw).map_err(|source| ProtocolError::Malformed { kind, source })
}

/// Anything the writer thread puts on the wire, in queue order.
#[derive(Debug, PartialEq)]
pub enum OutboundMessage {
    Envelope(OutboundEnvelope),
    Notice(Notice),
}

impl OutboundMessage {
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Envelope(envelope) => serde_json::to_vec(envelope),
            Self::Notice(notice) => Ok(notice.text.as_bytes().to_vec()),
        }
    }
}

/// Plain-text notice such as `SHARED_MEM_READY:<channel>:<count>`. Holds a
/// slot in the outbox's notice budget until written or discarded.
#[derive(Debug)]
pub struct Notice {
    text: String,
    _slot: NoticeSlot,
}

impl Notice {
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Notice {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

#[derive(Debug)]
struct NoticeBudget {
    cap: usize,
    pending: AtomicUsize,
    dropped: AtomicU64,
}

impl NoticeBudget {
    fn acquire(self: &Arc<Self>) -> Option<NoticeSlot> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < self.cap).then_some(pending + 1)
            })
            .ok()?;
        Some(NoticeSlot(Arc::clone(self)))
    }
}

#[derive(Debug)]
struct NoticeSlot(Arc<NoticeBudget>);

impl Drop for NoticeSlot {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Sending half of the ordered outbound queue. Cloneable and `Send`, so
/// background producers can share it with the owning thread.
///
/// Envelopes are never dropped. Notices are lossy: each one supersedes the
/// last, so once `notice_cap` of them are waiting further ones are
/// discarded until the writer catches up.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: Sender<OutboundMessage>,
    notices: Arc<NoticeBudget>,
}

impl Outbox {
    pub fn new(tx: Sender<OutboundMessage>) -> Self {
        Self::with_notice_cap(tx, DEFAULT_OUTBOUND_NOTICE_CAP)
    }

    pub fn with_notice_cap(tx: Sender<OutboundMessage>, notice_cap: usize) -> Self {
        Self {
            tx,
            notices: Arc::new(NoticeBudget {
                cap: notice_cap,
                pending: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Queues an envelope. Returns `false` once the writer has gone away.
    pub fn send(&self, envelope: OutboundEnvelope) -> bool {
        self.push(OutboundMessage::Envelope(envelope))
    }

    /// Queues a notice unless the notice budget is spent. Returns `false`
    /// when the notice was dropped.
    pub fn send_notice(&self, text: impl Into<String>) -> bool {
        let Some(slot) = self.notices.acquire() else {
            let dropped = self.notices.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped.is_power_of_two() {
                tracing::warn!(
                    cap = self.notices.cap,
                    dropped,
                    "outbound notice queue full; readiness notice dropped"
                );
            }
            return false;
        };

        self.push(OutboundMessage::Notice(Notice {
            text: text.into(),
            _slot: slot,
        }))
    }

    fn push(&self, message: OutboundMessage) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("outbound queue closed; message dropped");
                false
            }
        }
    }
}

/// Writes queued messages until every sender is gone. A message that fails
/// to encode or exceeds `max_payload` is logged and skipped; only transport
/// errors end the loop.
pub fn writer_loop(rx: Receiver<OutboundMessage>, mut writer: impl Write, max_payload: usize) -> io::Result<()> {
    for message in rx {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("outbound message dropped: {err}");
                continue;
            }
        };

        if payload.len() > max_payload {
            tracing::warn!(
                len = payload.len(),
                cap = max_payload,
                "outbound frame over cap; message dropped"
            );
            continue;
        }

        write_frame(&mut writer, &payload, max_payload)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames until a clean EOF. Frame bodies are handed over undecoded.
pub fn reader_loop<F>(mut reader: impl Read, max_payload: usize, mut on_payload: F) -> io::Result<()>
where
    F: FnMut(Vec<u8>) -> bool,
{
    loop {
        match read_frame(&mut reader, max_payload) {
            Ok(payload) => {
                if !on_payload(payload) {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::mpsc;

    #[test]
    fn write_then_read_round_trip() {
        let payload = br#"{"type":"INIT_REQUEST"}"#;
        let mut out = Vec::new();

        write_frame(&mut out, payload, DEFAULT_INBOUND_FRAME_CAP).expect("frame write");

        let mut cursor = Cursor::new(out);
        let decoded = read_frame(&mut cursor, DEFAULT_INBOUND_FRAME_CAP).expect("frame read");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let data = vec![0, 0, 0, 5, b'a', b'b'];
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, DEFAULT_INBOUND_FRAME_CAP).expect_err("expected eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let len = (DEFAULT_INBOUND_FRAME_CAP as u32) + 1;
        let data = len.to_be_bytes().to_vec();
        let mut cursor = Cursor::new(data);
        let err = read_frame(&mut cursor, DEFAULT_INBOUND_FRAME_CAP).expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut sink = Vec::new();
        let err = write_frame(&mut sink, b"abcd", 3).expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(sink.is_empty());
    }

    #[test]
    fn endian_is_big_endian() {
        let payload = b"abc";
        let mut out = Vec::new();
        write_frame(&mut out, payload, DEFAULT_OUTBOUND_FRAME_CAP).expect("frame write");
        assert_eq!(&out[0..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn reader_loop_stops_cleanly_at_eof() {
        let mut data = Vec::new();
        write_frame(&mut data, b"one", 16).expect("frame write");
        write_frame(&mut data, b"two", 16).expect("frame write");

        let mut seen = Vec::new();
        reader_loop(Cursor::new(data), 16, |payload| {
            seen.push(payload);
            true
        })
        .expect("clean eof");

        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn reader_loop_surfaces_oversized_frames() {
        let data = 100_u32.to_be_bytes().to_vec();
        let err = reader_loop(Cursor::new(data), 16, |_| true).expect_err("too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn writer_loop_frames_envelopes_and_text_in_order() {
        let (tx, rx) = mpsc::channel();
        let outbox = Outbox::new(tx);
        assert!(outbox.send(state_sync_envelope("VisionVM", "exposure", json!(50))));
        assert!(outbox.send_notice("SHARED_MEM_READY:sine-wave:1000"));
        drop(outbox);

        let mut out = Vec::new();
        writer_loop(rx, &mut out, DEFAULT_OUTBOUND_FRAME_CAP).expect("writer");

        let mut cursor = Cursor::new(out);
        let first = read_frame(&mut cursor, DEFAULT_OUTBOUND_FRAME_CAP).expect("first");
        let second = read_frame(&mut cursor, DEFAULT_OUTBOUND_FRAME_CAP).expect("second");

        let first: Value = serde_json::from_slice(&first).expect("json");
        assert_eq!(
            first,
            json!({"type": "STATE_SYNC", "payload": {"vmName": "VisionVM", "propName": "exposure", "value": 50}})
        );
        assert_eq!(second, b"SHARED_MEM_READY:sine-wave:1000");
    }

    #[test]
    fn writer_loop_skips_oversized_messages() {
        let (tx, rx) = mpsc::channel();
        let outbox = Outbox::new(tx);
        let long = "x".repeat(256);
        assert!(outbox.send(state_sync_envelope("ComplexVM", "logs", json!([long]))));
        assert!(outbox.send(state_sync_envelope("VisionVM", "gain", json!(2))));
        drop(outbox);

        let mut out = Vec::new();
        writer_loop(rx, &mut out, 128).expect("writer keeps going");

        let mut cursor = Cursor::new(out);
        let only = read_frame(&mut cursor, 128).expect("small frame");
        let only: Value = serde_json::from_slice(&only).expect("json");
        assert_eq!(only["payload"]["propName"], json!("gain"));
        assert_eq!(cursor.position() as usize, cursor.get_ref().len());
    }

    #[test]
    fn notices_beyond_budget_are_dropped_until_written() {
        let (tx, rx) = mpsc::channel();
        let outbox = Outbox::with_notice_cap(tx, 2);

        assert!(outbox.send_notice("SHARED_MEM_READY:sine-wave:1"));
        assert!(outbox.send_notice("SHARED_MEM_READY:sine-wave:2"));
        assert!(!outbox.send_notice("SHARED_MEM_READY:sine-wave:3"));
        assert!(outbox.send(state_sync_envelope("VisionVM", "gain", json!(2))));

        let first = rx.try_recv().expect("first notice");
        assert!(matches!(&first, OutboundMessage::Notice(notice) if notice.text() == "SHARED_MEM_READY:sine-wave:1"));
        drop(first);
        assert!(outbox.send_notice("SHARED_MEM_READY:sine-wave:4"));

        let rest: Vec<OutboundMessage> = rx.try_iter().collect();
        assert_eq!(rest.len(), 3);
        assert!(matches!(&rest[1], OutboundMessage::Envelope(_)));
    }

    #[test]
    fn decodes_state_set_envelope() {
        let payload = br#"{"type":"STATE_SET","payload":{"vmName":"VisionVM","propName":"Gain","value":2.5}}"#;

        match decode_inbound(payload).expect("decode state set") {
            InboundEnvelope::StateSet { payload } => {
                assert_eq!(payload.vm_name, "VisionVM");
                assert_eq!(payload.prop_name, "Gain");
                assert_eq!(payload.value, json!(2.5));
            }
            other => panic!("expected state set, got {other:?}"),
        }
    }

    #[test]
    fn decodes_command_with_either_request_id_shape() {
        let numeric = br#"{"type":"COMMAND","payload":{"vmName":"VisionVM","methodName":"toggleRunning","args":{"reason":"x"},"requestId":7}}"#;
        let textual = br#"{"type":"COMMAND","payload":{"vmName":"VisionVM","methodName":"toggleRunning","requestId":"req-1"}}"#;
        let absent = br#"{"type":"COMMAND","payload":{"vmName":"VisionVM","methodName":"toggleRunning"}}"#;

        let ids: Vec<Option<RequestId>> = [&numeric[..], &textual[..], &absent[..]]
            .into_iter()
            .map(|raw| match decode_inbound(raw).expect("decode command") {
                InboundEnvelope::Command { payload } => payload.request_id,
                other => panic!("expected command, got {other:?}"),
            })
            .collect();

        assert_eq!(
            ids,
            vec![
                Some(RequestId::Number(7)),
                Some(RequestId::Text("req-1".to_string())),
                None
            ]
        );
    }

    #[test]
    fn decodes_bare_requests() {
        assert_eq!(
            decode_inbound(br#"{"type":"INIT_REQUEST"}"#).expect("init"),
            InboundEnvelope::InitRequest
        );
        assert_eq!(
            decode_inbound(br#"{"type":"REQUEST_BUFFER_HANDLE","channelName":"sine-wave"}"#).expect("buffer"),
            InboundEnvelope::RequestBufferHandle {
                channel_name: Some("sine-wave".to_string())
            }
        );
    }

    #[test]
    fn classifies_bad_envelopes() {
        assert!(matches!(decode_inbound(b"{nope"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode_inbound(br#"{"payload":{}}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode_inbound(br#"{"type":"SHUTDOWN"}"#),
            Err(ProtocolError::UnknownKind(kind)) if kind == "SHUTDOWN"
        ));
        assert!(matches!(
            decode_inbound(br#"{"type":"STATE_SET","payload":{"propName":"x"}}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn encodes_command_responses() {
        let ok = serde_json::to_value(command_success_envelope(RequestId::Text("r1".to_string()), Some(json!("done"))))
            .expect("encode");
        assert_eq!(
            ok,
            json!({"type": "COMMAND_RESPONSE", "payload": {"requestId": "r1", "success": true, "result": "done"}})
        );

        let failed = serde_json::to_value(command_failure_envelope(RequestId::Number(3), "boom")).expect("encode");
        assert_eq!(failed["payload"]["success"], json!(false));
        assert_eq!(failed["payload"]["error"], json!("boom"));
        assert!(failed["payload"].get("result").is_none());
    }

    #[test]
    fn encodes_init_response_as_state_map() {
        let mut state = Map::new();
        state.insert("VisionVM".to_string(), json!({"exposure": 1}));
        let value = serde_json::to_value(OutboundEnvelope::InitResponse { state }).expect("encode");
        assert_eq!(value, json!({"type": "INIT_RESPONSE", "state": {"VisionVM": {"exposure": 1}}}));
    }
}
