use thiserror::Error;

/// Programming-contract violations surfaced to the caller at registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("view-model '{0}' is already registered")]
    DuplicateNode(String),
}

/// Reasons an inbound field write was not applied.
#[derive(Debug, Error)]
pub enum FieldError {
    #[error("field '{field}' not found on '{node}'")]
    NotFound { node: String, field: String },

    #[error("field '{field}' on '{node}' is read-only")]
    ReadOnly { node: String, field: String },

    #[error("cannot convert value for '{node}.{field}': {source}")]
    Coercion {
        node: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{node}' state is borrowed elsewhere")]
    Busy { node: String },
}

/// Failures of a single command invocation. Reported back to the caller as
/// a failed `COMMAND_RESPONSE`; the message is the `Display` output.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command not found: {node}.{method}")]
    NotFound { node: String, method: String },

    #[error("invalid argument '{param}': {source}")]
    Argument {
        param: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("argument {index} is not a {expected}")]
    ArgumentType { index: usize, expected: &'static str },

    #[error("failed to serialize result: {0}")]
    Result(#[source] serde_json::Error),

    #[error("{0}")]
    Failed(String),

    #[error("command panicked: {0}")]
    Panicked(String),
}

impl CommandError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Inbound envelopes that cannot be routed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("envelope has no 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    #[error("malformed {kind} envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
