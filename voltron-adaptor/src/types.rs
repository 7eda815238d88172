// Debugger data model
//
// Snapshots of debugger state handed from an adaptor to the broker. All of
// these are produced per request and never mutated by the broker.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub type TargetId = u32;
pub type ThreadId = u64;

/// Execution state of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Invalid,
    Running,
    Stopped,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Invalid => "invalid",
            TargetState::Running => "running",
            TargetState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

/// One debugging session as enumerated by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub file: String,
    pub arch: String,
    pub state: TargetState,
    pub byte_order: ByteOrder,
    pub addr_size: u8,
}

/// Value of a single register, or `n/a` when the host could not read it.
///
/// Vector and FPU registers can be up to 128 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Value(u128),
    NotAvailable,
}

impl RegisterValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegisterValue::Value(v) => u64::try_from(*v).ok(),
            RegisterValue::NotAvailable => None,
        }
    }
}

impl From<u64> for RegisterValue {
    fn from(value: u64) -> Self {
        RegisterValue::Value(value as u128)
    }
}

impl Serialize for RegisterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RegisterValue::Value(v) => match u64::try_from(*v) {
                Ok(small) => serializer.serialize_u64(small),
                Err(_) => serializer.serialize_u128(*v),
            },
            RegisterValue::NotAvailable => serializer.serialize_str("n/a"),
        }
    }
}

impl<'de> Deserialize<'de> for RegisterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RegisterValueVisitor;

        impl<'de> Visitor<'de> for RegisterValueVisitor {
            type Value = RegisterValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an unsigned integer or \"n/a\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(RegisterValue::Value(v as u128))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
                Ok(RegisterValue::Value(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|v| RegisterValue::Value(v as u128))
                    .map_err(|_| E::custom("negative register value"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                // Values wider than 64 bits lose precision through serde_json::Value
                if v >= 0.0 {
                    Ok(RegisterValue::Value(v as u128))
                } else {
                    Err(E::custom("negative register value"))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "n/a" {
                    Ok(RegisterValue::NotAvailable)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(RegisterValueVisitor)
    }
}

/// Register name to value, ordered by name for stable output
pub type RegisterSet = BTreeMap<String, RegisterValue>;

/// One hop (or the terminal annotation) of a dereference chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerefNode {
    Pointer(u64),
    Symbol(String),
    String(String),
    Unicode(String),
    Circular,
}

impl DerefNode {
    pub fn tag(&self) -> &'static str {
        match self {
            DerefNode::Pointer(_) => "pointer",
            DerefNode::Symbol(_) => "symbol",
            DerefNode::String(_) => "string",
            DerefNode::Unicode(_) => "unicode",
            DerefNode::Circular => "circular",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DerefNode::Pointer(_))
    }
}

// Wire form is a two element array: ["pointer", 4096], ["symbol", "main + 0x0"]
impl Serialize for DerefNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(self.tag())?;
        match self {
            DerefNode::Pointer(addr) => tuple.serialize_element(addr)?,
            DerefNode::Symbol(s) | DerefNode::String(s) | DerefNode::Unicode(s) => {
                tuple.serialize_element(s)?
            }
            DerefNode::Circular => tuple.serialize_element("circular")?,
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for DerefNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DerefNodeVisitor;

        impl<'de> Visitor<'de> for DerefNodeVisitor {
            type Value = DerefNode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [tag, value] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: serde_json::Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                let text = || {
                    value
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| de::Error::custom(format!("{} node needs a string", tag)))
                };

                match tag.as_str() {
                    "pointer" => value
                        .as_u64()
                        .map(DerefNode::Pointer)
                        .ok_or_else(|| de::Error::custom("pointer node needs an address")),
                    "symbol" => text().map(DerefNode::Symbol),
                    "string" => text().map(DerefNode::String),
                    "unicode" => text().map(DerefNode::Unicode),
                    "circular" => Ok(DerefNode::Circular),
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["pointer", "symbol", "string", "unicode", "circular"],
                    )),
                }
            }
        }

        deserializer.deserialize_seq(DerefNodeVisitor)
    }
}

pub type DerefChain = Vec<DerefNode>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointLocation {
    pub address: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: u32,
    pub enabled: bool,
    pub one_shot: bool,
    pub hit_count: u32,
    pub locations: Vec<BreakpointLocation>,
}

/// Backtrace frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub index: u32,
    pub addr: u64,
    pub name: String,
}

impl Frame {
    /// Build a frame named like "module`symbol + offset"
    pub fn new(index: u32, addr: u64, module: &str, symbol: &str, offset: u64) -> Self {
        let module = Path::new(module)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| module.to_string());

        Self {
            index,
            addr,
            name: format!("{}`{} + {}", module, symbol, offset),
        }
    }
}

/// Source file and line for an address; serialised as ["main.c", 8]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation(pub String, pub u32);

/// Optional adaptor capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Adaptor methods may be called from a background thread while the
    /// host is running; requests need not be queued to the next stop.
    Async,
}
