// Voltron API protocol definitions
//
// JSON envelopes exchanged with clients, the numeric error codes, and the
// base64 wrapper used for binary payload fields.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::{to_raw_value, RawValue};
use serde_json::Value;
use thiserror::Error;
use voltron_adaptor::{AdaptorError, TargetId};

pub const API_VERSION: f64 = 1.1;

// Error codes
pub const GENERIC_ERROR: u32 = 0x1000;
pub const INVALID_REQUEST: u32 = 0x1001;
pub const UNKNOWN_REQUEST: u32 = 0x1002;
pub const UNSUPPORTED_HOST: u32 = 0x1003;
pub const TIMED_OUT: u32 = 0x1004;
pub const NO_SUCH_TARGET: u32 = 0x1005;
pub const TARGET_BUSY: u32 = 0x1006;
pub const MISSING_FIELD: u32 = 0x1007;
pub const EMPTY_RESPONSE: u32 = 0x1008;
pub const SERVER_NOT_RUNNING: u32 = 0x1009;
pub const DEBUGGER_NOT_PRESENT: u32 = 0x100A;

pub type ApiResult<T> = Result<T, ApiError>;

/// Every failure a client can see, each with its wire code
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    #[error("{0}")]
    Generic(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown request type: {0}")]
    UnknownRequest(String),

    #[error("Debugger host does not support {0}")]
    UnsupportedHost(String),

    #[error("The request timed out")]
    TimedOut,

    #[error("No such target: {0}")]
    NoSuchTarget(TargetId),

    #[error("Target {0} is busy")]
    TargetBusy(TargetId),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Empty response")]
    EmptyResponse,

    #[error("The server is not running")]
    ServerNotRunning,

    #[error("No debugger host is present")]
    DebuggerNotPresent,
}

impl ApiError {
    pub fn code(&self) -> u32 {
        match self {
            ApiError::Generic(_) => GENERIC_ERROR,
            ApiError::InvalidRequest(_) => INVALID_REQUEST,
            ApiError::UnknownRequest(_) => UNKNOWN_REQUEST,
            ApiError::UnsupportedHost(_) => UNSUPPORTED_HOST,
            ApiError::TimedOut => TIMED_OUT,
            ApiError::NoSuchTarget(_) => NO_SUCH_TARGET,
            ApiError::TargetBusy(_) => TARGET_BUSY,
            ApiError::MissingField(_) => MISSING_FIELD,
            ApiError::EmptyResponse => EMPTY_RESPONSE,
            ApiError::ServerNotRunning => SERVER_NOT_RUNNING,
            ApiError::DebuggerNotPresent => DEBUGGER_NOT_PRESENT,
        }
    }
}

impl From<AdaptorError> for ApiError {
    fn from(e: AdaptorError) -> Self {
        match e {
            AdaptorError::NoSuchTarget(id) => ApiError::NoSuchTarget(id),
            AdaptorError::TargetBusy(id) => ApiError::TargetBusy(id),
            AdaptorError::Unsupported(op) => ApiError::UnsupportedHost(op.to_string()),
            other => ApiError::Generic(other.to_string()),
        }
    }
}

fn default_type() -> String {
    "request".to_string()
}

/// Inbound request envelope. `data` stays untyped until the kind is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type", default = "default_type")]
    pub message_type: String,
    pub request: String,
    #[serde(default)]
    pub block: bool,
    /// Seconds; the broker's default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    pub fn new(request: &str, data: Value) -> Self {
        Self {
            message_type: default_type(),
            request: request.to_string(),
            block: false,
            timeout: None,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: u32,
    pub message: String,
}

#[derive(Debug)]
pub enum ResponseData {
    /// Already-serialised payload; keeps 128-bit register values intact
    Success(Box<RawValue>),
    Error(ErrorData),
}

/// Outbound response envelope
#[derive(Debug)]
pub struct ApiResponse {
    pub data: ResponseData,
}

impl ApiResponse {
    pub fn success<T: Serialize>(payload: &T) -> ApiResult<Self> {
        let raw = to_raw_value(payload)
            .map_err(|e| ApiError::Generic(format!("Failed to serialise response: {}", e)))?;
        Ok(Self {
            data: ResponseData::Success(raw),
        })
    }

    pub fn error(err: &ApiError) -> Self {
        Self {
            data: ResponseData::Error(ErrorData {
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    pub fn status(&self) -> Status {
        match self.data {
            ResponseData::Success(_) => Status::Success,
            ResponseData::Error(_) => Status::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == Status::Success
    }

    pub fn error_code(&self) -> Option<u32> {
        match &self.data {
            ResponseData::Error(e) => Some(e.code),
            ResponseData::Success(_) => None,
        }
    }

    /// Decode a success payload into `T`
    pub fn payload<T: DeserializeOwned>(&self) -> ApiResult<T> {
        match &self.data {
            ResponseData::Success(raw) => serde_json::from_str(raw.get())
                .map_err(|e| ApiError::InvalidRequest(format!("Bad response payload: {}", e))),
            ResponseData::Error(e) => Err(ApiError::Generic(e.message.clone())),
        }
    }

    /// Parse a response envelope as received by a client
    pub fn from_json(body: &str) -> ApiResult<Self> {
        if body.trim().is_empty() {
            return Err(ApiError::EmptyResponse);
        }

        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "type")]
            message_type: String,
            status: Status,
            data: Box<RawValue>,
        }

        let wire: Wire = serde_json::from_str(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Bad response: {}", e)))?;
        if wire.message_type != "response" {
            return Err(ApiError::InvalidRequest(format!(
                "Expected a response, got {}",
                wire.message_type
            )));
        }

        let data = match wire.status {
            Status::Success => ResponseData::Success(wire.data),
            Status::Error => ResponseData::Error(
                serde_json::from_str(wire.data.get())
                    .map_err(|e| ApiError::InvalidRequest(format!("Bad error payload: {}", e)))?,
            ),
        };
        Ok(Self { data })
    }
}

impl Serialize for ApiResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ApiResponse", 3)?;
        s.serialize_field("type", "response")?;
        s.serialize_field("status", &self.status())?;
        match &self.data {
            ResponseData::Success(raw) => s.serialize_field("data", raw)?,
            ResponseData::Error(e) => s.serialize_field("data", e)?,
        }
        s.end()
    }
}

impl From<ApiError> for ApiResponse {
    fn from(e: ApiError) -> Self {
        ApiResponse::error(&e)
    }
}

/// Bytes carried as base64 text on the wire
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Binary(pub Vec<u8>);

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binary({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Binary(bytes)
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BinaryVisitor;

        impl<'de> Visitor<'de> for BinaryVisitor {
            type Value = Binary;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a base64 string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Binary, E> {
                BASE64_STANDARD
                    .decode(v)
                    .map(Binary)
                    .map_err(|e| E::custom(format!("invalid base64: {}", e)))
            }
        }

        deserializer.deserialize_str(BinaryVisitor)
    }
}
