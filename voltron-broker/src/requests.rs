// Typed request payloads
//
// Each request kind has its own payload struct. Every field is optional at
// the serde level so that a missing required field is reported by
// `Request::validate` as `MissingField` instead of a parse failure.
// Payloads serialise back to the same wire form, so clients can build
// requests with the same types.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use voltron_adaptor::{TargetId, TargetState, ThreadId};

use crate::protocol::{ApiError, ApiResult, Binary, RequestEnvelope};

/// Payload fields that always carry text, whatever they look like
pub const TEXT_FIELDS: &[&str] = &["command", "register", "registers", "state_changes"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Version,
    State,
    Targets,
    Registers,
    Memory,
    WriteMemory,
    Stack,
    Disassemble,
    Command,
    Dereference,
    Breakpoints,
    Backtrace,
    SourceLocation,
    Plugins,
    Wait,
    Null,
}

impl RequestKind {
    pub const ALL: [RequestKind; 16] = [
        RequestKind::Version,
        RequestKind::State,
        RequestKind::Targets,
        RequestKind::Registers,
        RequestKind::Memory,
        RequestKind::WriteMemory,
        RequestKind::Stack,
        RequestKind::Disassemble,
        RequestKind::Command,
        RequestKind::Dereference,
        RequestKind::Breakpoints,
        RequestKind::Backtrace,
        RequestKind::SourceLocation,
        RequestKind::Plugins,
        RequestKind::Wait,
        RequestKind::Null,
    ];

    /// Wire name
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Version => "version",
            RequestKind::State => "state",
            RequestKind::Targets => "targets",
            RequestKind::Registers => "registers",
            RequestKind::Memory => "memory",
            RequestKind::WriteMemory => "write_memory",
            RequestKind::Stack => "stack",
            RequestKind::Disassemble => "disassemble",
            RequestKind::Command => "command",
            RequestKind::Dereference => "dereference",
            RequestKind::Breakpoints => "breakpoints",
            RequestKind::Backtrace => "backtrace",
            RequestKind::SourceLocation => "source_location",
            RequestKind::Plugins => "plugins",
            RequestKind::Wait => "wait",
            RequestKind::Null => "null",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }
}

/// Accept either a single value or a list of them
fn one_or_many<'de, D, T>(deserializer: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: de::DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(de::Error::custom))
            .collect::<Result<Vec<T>, _>>()
            .map(Some),
        Some(v) => serde_json::from_value(v)
            .map(|one| Some(vec![one]))
            .map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistersRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    /// Host command whose output names the address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<u64>,
    /// Bytes, or words when `words` is given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deref: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteMemoryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Binary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisassembleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DereferenceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktraceRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLocationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(deserialize_with = "one_or_many", skip_serializing_if = "Option::is_none")]
    pub state_changes: Option<Vec<TargetState>>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum Request {
    Version,
    State(TargetRequest),
    Targets,
    Registers(RegistersRequest),
    Memory(MemoryRequest),
    WriteMemory(WriteMemoryRequest),
    Stack(StackRequest),
    Disassemble(DisassembleRequest),
    Command(CommandRequest),
    Dereference(DereferenceRequest),
    Breakpoints(TargetRequest),
    Backtrace(BacktraceRequest),
    SourceLocation(SourceLocationRequest),
    Plugins,
    Wait(WaitRequest),
    Null,
}

fn payload<T: de::DeserializeOwned>(kind: RequestKind, data: Value) -> ApiResult<T> {
    // A request with no data block is the same as an empty one
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| ApiError::InvalidRequest(format!("Bad {} request: {}", kind.name(), e)))
}

impl Request {
    /// Build the typed request for `kind` from its `data` block
    pub fn parse(kind: RequestKind, data: Value) -> ApiResult<Self> {
        let req = match kind {
            RequestKind::Version => Request::Version,
            RequestKind::State => Request::State(payload(kind, data)?),
            RequestKind::Targets => Request::Targets,
            RequestKind::Registers => Request::Registers(payload(kind, data)?),
            RequestKind::Memory => Request::Memory(payload(kind, data)?),
            RequestKind::WriteMemory => Request::WriteMemory(payload(kind, data)?),
            RequestKind::Stack => Request::Stack(payload(kind, data)?),
            RequestKind::Disassemble => Request::Disassemble(payload(kind, data)?),
            RequestKind::Command => Request::Command(payload(kind, data)?),
            RequestKind::Dereference => Request::Dereference(payload(kind, data)?),
            RequestKind::Breakpoints => Request::Breakpoints(payload(kind, data)?),
            RequestKind::Backtrace => Request::Backtrace(payload(kind, data)?),
            RequestKind::SourceLocation => Request::SourceLocation(payload(kind, data)?),
            RequestKind::Plugins => Request::Plugins,
            RequestKind::Wait => Request::Wait(payload(kind, data)?),
            RequestKind::Null => Request::Null,
        };
        Ok(req)
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Version => RequestKind::Version,
            Request::State(_) => RequestKind::State,
            Request::Targets => RequestKind::Targets,
            Request::Registers(_) => RequestKind::Registers,
            Request::Memory(_) => RequestKind::Memory,
            Request::WriteMemory(_) => RequestKind::WriteMemory,
            Request::Stack(_) => RequestKind::Stack,
            Request::Disassemble(_) => RequestKind::Disassemble,
            Request::Command(_) => RequestKind::Command,
            Request::Dereference(_) => RequestKind::Dereference,
            Request::Breakpoints(_) => RequestKind::Breakpoints,
            Request::Backtrace(_) => RequestKind::Backtrace,
            Request::SourceLocation(_) => RequestKind::SourceLocation,
            Request::Plugins => RequestKind::Plugins,
            Request::Wait(_) => RequestKind::Wait,
            Request::Null => RequestKind::Null,
        }
    }

    /// Check that every required field is present
    pub fn validate(&self) -> ApiResult<()> {
        fn require<T>(field: &Option<T>, name: &'static str) -> ApiResult<()> {
            match field {
                Some(_) => Ok(()),
                None => Err(ApiError::MissingField(name)),
            }
        }

        match self {
            Request::Memory(r) => {
                if r.address.is_none() && r.register.is_none() && r.command.is_none() {
                    return Err(ApiError::MissingField("address"));
                }
                if r.length.is_none() && r.words.is_none() {
                    return Err(ApiError::MissingField("length"));
                }
                Ok(())
            }
            Request::WriteMemory(r) => {
                require(&r.address, "address")?;
                require(&r.value, "value")
            }
            Request::Stack(r) => require(&r.length, "length"),
            Request::Disassemble(r) => require(&r.count, "count"),
            Request::Command(r) => require(&r.command, "command"),
            Request::Dereference(r) => require(&r.pointer, "pointer"),
            _ => Ok(()),
        }
    }

    /// The `data` block this request serialises to
    pub fn data(&self) -> ApiResult<Value> {
        let data = match self {
            Request::Version | Request::Targets | Request::Plugins | Request::Null => {
                Ok(Value::Object(Map::new()))
            }
            Request::State(r) | Request::Breakpoints(r) => serde_json::to_value(r),
            Request::Registers(r) => serde_json::to_value(r),
            Request::Memory(r) => serde_json::to_value(r),
            Request::WriteMemory(r) => serde_json::to_value(r),
            Request::Stack(r) => serde_json::to_value(r),
            Request::Disassemble(r) => serde_json::to_value(r),
            Request::Command(r) => serde_json::to_value(r),
            Request::Dereference(r) => serde_json::to_value(r),
            Request::Backtrace(r) => serde_json::to_value(r),
            Request::SourceLocation(r) => serde_json::to_value(r),
            Request::Wait(r) => serde_json::to_value(r),
        };
        data.map_err(|e| ApiError::Generic(format!("Failed to encode {} request: {}", self.kind().name(), e)))
    }

    /// Wrap this request in a wire envelope. `block` and `timeout` are left
    /// at their defaults for the caller to set.
    pub fn to_envelope(&self) -> ApiResult<RequestEnvelope> {
        Ok(RequestEnvelope::new(self.kind().name(), self.data()?))
    }
}
