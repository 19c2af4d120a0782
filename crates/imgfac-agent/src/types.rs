//! Bus types, error definitions, and agent identity constants.

use crate::schema::Severity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Vendor advertised on the management bus.
pub const VENDOR: &str = "redhat.com";

/// Product advertised on the management bus.
pub const PRODUCT: &str = "imagefactory";

/// Instance name the root factory is published under.
pub const FACTORY_OBJECT_NAME: &str = "image_factory";

/// Replacement logged in place of a `credentials` argument.
pub const REDACTED: &str = "*** REDACTED ***";

/// Keyword arguments of a method call, or out-arguments of its response.
pub type Args = Map<String, Value>;

/// Errors that can occur while running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The call addressed neither the factory nor a registered object.
    #[error("{addr} does not match an object managed by ImageFactoryAgent!  Unable to respond to {method}.")]
    UnknownObject { addr: String, method: String },

    /// The target object has no method with this name.
    #[error("'{class}' object has no method '{method}'")]
    NoSuchMethod { class: String, method: String },

    /// The keyword arguments could not be bound to the method's parameters.
    #[error("{method}() got invalid arguments: {reason}")]
    InvalidArguments { method: String, reason: String },

    /// The target method itself failed.
    #[error("{0}")]
    Invocation(String),

    /// The method declares out-arguments but produced none.
    #[error("Method '{method}' on objects of class {class} must return a dictionary of {expected}")]
    ContractViolation {
        method: String,
        class: String,
        expected: String,
    },

    /// The bus session rejected an operation.
    #[error("Session error: {0}")]
    Session(String),

    /// The session is not open.
    #[error("Session is not open")]
    SessionClosed,

    /// The connection target could not be parsed.
    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error wrapper.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}

/// Address of an object published on the bus.
///
/// Serializes to the bus map form (`_object_name`, `_agent_name`,
/// `_agent_epoch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataAddr {
    #[serde(rename = "_object_name")]
    pub name: String,
    #[serde(rename = "_agent_name", default)]
    pub agent_name: String,
    #[serde(rename = "_agent_epoch", default)]
    pub agent_epoch: u64,
}

impl DataAddr {
    pub fn new(name: impl Into<String>, agent_name: impl Into<String>, agent_epoch: u64) -> Self {
        Self {
            name: name.into(),
            agent_name: agent_name.into(),
            agent_epoch,
        }
    }

    /// Registry key for this address.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Structural form returned to bus callers as an out-argument.
    pub fn as_map(&self) -> Value {
        let mut map = Map::new();
        map.insert("_object_name".to_string(), Value::from(self.name.clone()));
        map.insert("_agent_name".to_string(), Value::from(self.agent_name.clone()));
        map.insert("_agent_epoch".to_string(), Value::from(self.agent_epoch));
        Value::Object(map)
    }
}

impl fmt::Display for DataAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataAddr(name={}, agent={}, epoch={})",
            self.name, self.agent_name, self.agent_epoch
        )
    }
}

/// Response handle for one inbound method call.
///
/// Out-arguments accumulate here until the handle is passed back to the
/// session as a success.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodHandle {
    pub id: u64,
    pub out_args: Args,
}

impl MethodHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            out_args: Args::new(),
        }
    }

    pub fn add_return_argument(&mut self, name: impl Into<String>, value: Value) {
        self.out_args.insert(name.into(), value);
    }
}

/// An inbound method invocation as delivered by the bus session.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub handle: MethodHandle,
    pub method_name: String,
    pub args: Args,
    pub subtypes: Args,
    pub addr: DataAddr,
    pub user_id: String,
}

impl MethodCall {
    pub fn new(handle_id: u64, method_name: impl Into<String>, args: Args, addr: DataAddr) -> Self {
        Self {
            handle: MethodHandle::new(handle_id),
            method_name: method_name.into(),
            args,
            subtypes: Args::new(),
            addr,
            user_id: String::new(),
        }
    }
}

/// Snapshot of an object's properties, as published with `add_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataObject {
    pub class_name: String,
    #[serde(default)]
    pub properties: Args,
}

impl DataObject {
    pub fn new(class_name: impl Into<String>, properties: Args) -> Self {
        Self {
            class_name: class_name.into(),
            properties,
        }
    }
}

/// An event raised on the bus on behalf of a managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub class_name: String,
    pub severity: Severity,
    #[serde(default)]
    pub properties: Args,
}

/// Bind keyword arguments to a typed parameter struct.
pub fn parse_args<T: DeserializeOwned>(method: &str, args: &Args) -> Result<T, AgentError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| AgentError::InvalidArguments {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Copy of `args` that is safe to write to the log.
pub fn redact_args(args: &Args) -> Args {
    let mut redacted = args.clone();
    if let Some(value) = redacted.get_mut("credentials") {
        *value = Value::from(REDACTED);
    }
    redacted
}
