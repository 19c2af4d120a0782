//! Management-bus sessions.
//!
//! A `BusSession` announces the agent, publishes schemas and objects, and
//! delivers inbound method calls. `BrokerSession` speaks to a broker over
//! TCP; `MemorySession` keeps everything in process and records what the
//! agent did.

use crate::schema::Schema;
use crate::transport::{BrokerConnection, ConnectionOptions, ConnectionTarget};
use crate::types::{AgentError, AgentEvent, Args, DataAddr, DataObject, MethodCall, MethodHandle, PRODUCT, VENDOR};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection between the agent and the management bus.
#[async_trait]
pub trait BusSession: Send {
    /// Name this agent is known by on the bus.
    fn agent_name(&self) -> &str;

    async fn open(&mut self) -> Result<(), AgentError>;

    async fn close(&mut self) -> Result<(), AgentError>;

    async fn register_schema(&mut self, schema: &Schema) -> Result<(), AgentError>;

    /// Publish `object` under instance `name`, returning its bus address.
    async fn add_data(
        &mut self,
        object: DataObject,
        name: &str,
        persistent: bool,
    ) -> Result<DataAddr, AgentError>;

    /// Re-send the current state of an object already published at `addr`.
    async fn update_data(&mut self, addr: &DataAddr, object: DataObject) -> Result<(), AgentError>;

    /// Withdraw a published object.
    async fn del_data(&mut self, addr: &DataAddr) -> Result<(), AgentError>;

    /// Answer a call with the out-arguments accumulated on `handle`.
    async fn method_success(&mut self, handle: MethodHandle) -> Result<(), AgentError>;

    /// Answer a call with an exception carrying `message`.
    async fn raise_exception(&mut self, handle: MethodHandle, message: &str) -> Result<(), AgentError>;

    async fn raise_event(&mut self, event: &AgentEvent) -> Result<(), AgentError>;

    /// Next inbound call. `None` when no more calls can arrive.
    ///
    /// Must be cancel safe: it is polled inside `tokio::select!`.
    async fn next_call(&mut self) -> Option<MethodCall>;

    /// Try to re-establish a lost session. `Ok(false)` means the session
    /// does not reconnect.
    async fn reconnect(&mut self) -> Result<bool, AgentError> {
        Ok(false)
    }
}

/// Agent name in `<vendor>:<product>:<instance>` form.
pub fn new_agent_name() -> String {
    format!("{}:{}:{}", VENDOR, PRODUCT, Uuid::new_v4())
}

fn new_epoch() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Messages exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    AgentOpen {
        agent: String,
        vendor: String,
        product: String,
        epoch: u64,
    },
    AgentClose {
        agent: String,
    },
    Schema {
        agent: String,
        schema: Schema,
    },
    Data {
        agent: String,
        addr: DataAddr,
        object: DataObject,
        persistent: bool,
    },
    DataDeleted {
        agent: String,
        addr: DataAddr,
    },
    Event {
        agent: String,
        event: AgentEvent,
    },
    MethodRequest {
        handle: u64,
        method: String,
        #[serde(default)]
        args: Args,
        #[serde(default)]
        subtypes: Args,
        addr: DataAddr,
        #[serde(default)]
        user_id: String,
    },
    MethodResponse {
        handle: u64,
        out_args: Args,
    },
    MethodException {
        handle: u64,
        message: String,
    },
}

#[derive(Debug, Clone)]
struct Published {
    addr: DataAddr,
    object: DataObject,
    persistent: bool,
}

/// Session with a broker over the framed TCP transport.
///
/// Everything announced while open is remembered and replayed when the
/// session reconnects.
pub struct BrokerSession {
    connection: BrokerConnection,
    agent_name: String,
    epoch: u64,
    schemas: Vec<Schema>,
    published: Vec<Published>,
    is_open: bool,
}

impl BrokerSession {
    pub fn new(target: ConnectionTarget, options: ConnectionOptions) -> Self {
        Self {
            connection: BrokerConnection::new(target, options),
            agent_name: new_agent_name(),
            epoch: new_epoch(),
            schemas: Vec::new(),
            published: Vec::new(),
            is_open: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    async fn send(&mut self, frame: Frame) -> Result<(), AgentError> {
        if !self.is_open {
            return Err(AgentError::SessionClosed);
        }
        self.connection.send(&frame).await
    }

    async fn announce(&mut self) -> Result<(), AgentError> {
        let frame = Frame::AgentOpen {
            agent: self.agent_name.clone(),
            vendor: VENDOR.to_string(),
            product: PRODUCT.to_string(),
            epoch: self.epoch,
        };
        self.connection.send(&frame).await
    }

    /// Re-send schemas and published objects after a reconnect.
    async fn replay(&mut self) -> Result<(), AgentError> {
        let mut frames = Vec::with_capacity(self.schemas.len() + self.published.len());
        for schema in &self.schemas {
            frames.push(Frame::Schema {
                agent: self.agent_name.clone(),
                schema: schema.clone(),
            });
        }
        for data in &self.published {
            frames.push(Frame::Data {
                agent: self.agent_name.clone(),
                addr: data.addr.clone(),
                object: data.object.clone(),
                persistent: data.persistent,
            });
        }

        debug!(
            schemas = self.schemas.len(),
            objects = self.published.len(),
            "Replaying session state"
        );
        for frame in frames {
            self.connection.send(&frame).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BusSession for BrokerSession {
    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn open(&mut self) -> Result<(), AgentError> {
        self.connection.open().await?;
        self.announce().await?;
        self.is_open = true;
        info!(
            agent = %self.agent_name,
            broker = %self.connection.target(),
            "Agent session opened"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if !self.is_open {
            return Ok(());
        }

        let farewell = Frame::AgentClose {
            agent: self.agent_name.clone(),
        };
        let sent = self.connection.send(&farewell).await;
        self.is_open = false;
        let closed = self.connection.close().await;

        info!(agent = %self.agent_name, "Agent session closed");
        sent.and(closed)
    }

    async fn register_schema(&mut self, schema: &Schema) -> Result<(), AgentError> {
        self.send(Frame::Schema {
            agent: self.agent_name.clone(),
            schema: schema.clone(),
        })
        .await?;
        self.schemas.push(schema.clone());
        Ok(())
    }

    async fn add_data(
        &mut self,
        object: DataObject,
        name: &str,
        persistent: bool,
    ) -> Result<DataAddr, AgentError> {
        let addr = DataAddr::new(name, self.agent_name.clone(), self.epoch);
        self.send(Frame::Data {
            agent: self.agent_name.clone(),
            addr: addr.clone(),
            object: object.clone(),
            persistent,
        })
        .await?;

        self.published.retain(|p| p.addr != addr);
        self.published.push(Published {
            addr: addr.clone(),
            object,
            persistent,
        });
        Ok(addr)
    }

    async fn update_data(&mut self, addr: &DataAddr, object: DataObject) -> Result<(), AgentError> {
        let persistent = self
            .published
            .iter()
            .find(|p| &p.addr == addr)
            .map(|p| p.persistent)
            .ok_or_else(|| AgentError::Session(format!("{} is not published", addr)))?;

        self.send(Frame::Data {
            agent: self.agent_name.clone(),
            addr: addr.clone(),
            object: object.clone(),
            persistent,
        })
        .await?;

        if let Some(entry) = self.published.iter_mut().find(|p| &p.addr == addr) {
            entry.object = object;
        }
        Ok(())
    }

    async fn del_data(&mut self, addr: &DataAddr) -> Result<(), AgentError> {
        self.published.retain(|p| &p.addr != addr);
        self.send(Frame::DataDeleted {
            agent: self.agent_name.clone(),
            addr: addr.clone(),
        })
        .await
    }

    async fn method_success(&mut self, handle: MethodHandle) -> Result<(), AgentError> {
        self.send(Frame::MethodResponse {
            handle: handle.id,
            out_args: handle.out_args,
        })
        .await
    }

    async fn raise_exception(&mut self, handle: MethodHandle, message: &str) -> Result<(), AgentError> {
        self.send(Frame::MethodException {
            handle: handle.id,
            message: message.to_string(),
        })
        .await
    }

    async fn raise_event(&mut self, event: &AgentEvent) -> Result<(), AgentError> {
        self.send(Frame::Event {
            agent: self.agent_name.clone(),
            event: event.clone(),
        })
        .await
    }

    async fn next_call(&mut self) -> Option<MethodCall> {
        loop {
            let message: Value = self.connection.recv().await?;
            match serde_json::from_value::<Frame>(message) {
                Ok(Frame::MethodRequest {
                    handle,
                    method,
                    args,
                    subtypes,
                    addr,
                    user_id,
                }) => {
                    return Some(MethodCall {
                        handle: MethodHandle::new(handle),
                        method_name: method,
                        args,
                        subtypes,
                        addr,
                        user_id,
                    });
                }
                Ok(other) => debug!(frame = ?other, "Ignoring unexpected frame from broker"),
                Err(e) => warn!(error = %e, "Malformed frame from broker"),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<bool, AgentError> {
        if !self.is_open || !self.connection.options().reconnect {
            return Ok(false);
        }

        warn!(broker = %self.connection.target(), "Broker connection lost, reconnecting");
        self.connection.open().await?;
        self.announce().await?;
        self.replay().await?;
        info!(agent = %self.agent_name, "Agent session re-established");
        Ok(true)
    }
}

/// An object published on a `MemorySession`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedData {
    pub addr: DataAddr,
    pub object: DataObject,
    pub persistent: bool,
}

/// A response the agent sent through a `MemorySession`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success { handle: u64, out_args: Args },
    Exception { handle: u64, message: String },
}

impl Response {
    pub fn handle(&self) -> u64 {
        match self {
            Response::Success { handle, .. } | Response::Exception { handle, .. } => *handle,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

/// Injects method calls into a `MemorySession`.
#[derive(Debug, Clone)]
pub struct CallSender {
    calls: mpsc::UnboundedSender<MethodCall>,
    next_handle: Arc<AtomicU64>,
}

impl CallSender {
    /// Queue a call of `method` on `addr`, returning its handle id.
    pub fn call(&self, addr: &DataAddr, method: &str, args: Value) -> Result<u64, AgentError> {
        let args = match args {
            Value::Object(map) => map,
            Value::Null => Args::new(),
            other => {
                return Err(AgentError::Other(format!(
                    "method arguments must be a mapping, got {}",
                    other
                )))
            }
        };

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.calls
            .send(MethodCall::new(id, method, args, addr.clone()))
            .map_err(|_| AgentError::SessionClosed)?;
        Ok(id)
    }
}

/// In-process session that records everything the agent sends.
#[derive(Debug)]
pub struct MemorySession {
    agent_name: String,
    epoch: u64,
    is_open: bool,
    calls: mpsc::UnboundedReceiver<MethodCall>,
    schemas: Vec<Schema>,
    published: Vec<PublishedData>,
    deleted: Vec<DataAddr>,
    responses: Vec<Response>,
    events: Vec<AgentEvent>,
    fail_open: bool,
    fail_close: bool,
    add_data_budget: Option<usize>,
}

impl MemorySession {
    pub fn new() -> (Self, CallSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            agent_name: new_agent_name(),
            epoch: new_epoch(),
            is_open: false,
            calls: rx,
            schemas: Vec::new(),
            published: Vec::new(),
            deleted: Vec::new(),
            responses: Vec::new(),
            events: Vec::new(),
            fail_open: false,
            fail_close: false,
            add_data_budget: None,
        };
        let sender = CallSender {
            calls: tx,
            next_handle: Arc::new(AtomicU64::new(1)),
        };
        (session, sender)
    }

    /// Make the next `open` fail.
    pub fn set_fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    /// Make `close` fail.
    pub fn set_fail_close(&mut self, fail: bool) {
        self.fail_close = fail;
    }

    /// Let `count` more `add_data` calls succeed, then refuse the rest.
    /// `None` lifts the limit.
    pub fn set_add_data_budget(&mut self, count: Option<usize>) {
        self.add_data_budget = count;
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Current state of the object published at `addr`.
    pub fn published_at(&self, addr: &DataAddr) -> Option<&PublishedData> {
        self.published.iter().find(|p| &p.addr == addr)
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    pub fn published(&self) -> &[PublishedData] {
        &self.published
    }

    pub fn deleted(&self) -> &[DataAddr] {
        &self.deleted
    }

    pub fn responses(&self) -> &[Response] {
        &self.responses
    }

    /// Response sent for call `handle`, if any.
    pub fn response(&self, handle: u64) -> Option<&Response> {
        self.responses.iter().find(|r| r.handle() == handle)
    }

    pub fn events(&self) -> &[AgentEvent] {
        &self.events
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.is_open {
            Ok(())
        } else {
            Err(AgentError::SessionClosed)
        }
    }
}

#[async_trait]
impl BusSession for MemorySession {
    fn agent_name(&self) -> &str {
        &self.agent_name
    }

    async fn open(&mut self) -> Result<(), AgentError> {
        if self.fail_open {
            return Err(AgentError::Session("connection refused".to_string()));
        }
        self.is_open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if self.fail_close {
            return Err(AgentError::Session("close failed".to_string()));
        }
        self.is_open = false;
        self.calls.close();
        Ok(())
    }

    async fn register_schema(&mut self, schema: &Schema) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.schemas.push(schema.clone());
        Ok(())
    }

    async fn add_data(
        &mut self,
        object: DataObject,
        name: &str,
        persistent: bool,
    ) -> Result<DataAddr, AgentError> {
        self.ensure_open()?;
        match self.add_data_budget {
            Some(0) => return Err(AgentError::Session("broker refused".to_string())),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }

        let addr = DataAddr::new(name, self.agent_name.clone(), self.epoch);
        self.published.push(PublishedData {
            addr: addr.clone(),
            object,
            persistent,
        });
        Ok(addr)
    }

    async fn update_data(&mut self, addr: &DataAddr, object: DataObject) -> Result<(), AgentError> {
        self.ensure_open()?;
        let entry = self
            .published
            .iter_mut()
            .find(|p| &p.addr == addr)
            .ok_or_else(|| AgentError::Session(format!("{} is not published", addr)))?;
        entry.object = object;
        Ok(())
    }

    async fn del_data(&mut self, addr: &DataAddr) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.deleted.push(addr.clone());
        Ok(())
    }

    async fn method_success(&mut self, handle: MethodHandle) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.responses.push(Response::Success {
            handle: handle.id,
            out_args: handle.out_args,
        });
        Ok(())
    }

    async fn raise_exception(&mut self, handle: MethodHandle, message: &str) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.responses.push(Response::Exception {
            handle: handle.id,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn raise_event(&mut self, event: &AgentEvent) -> Result<(), AgentError> {
        self.ensure_open()?;
        self.events.push(event.clone());
        Ok(())
    }

    async fn next_call(&mut self) -> Option<MethodCall> {
        self.calls.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Severity;
    use crate::transport::{encode_frame, read_frame};
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn next_frame<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Frame {
        let body = read_frame(reader).await.unwrap().unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[test]
    fn test_agent_name_format() {
        let name = new_agent_name();
        let mut parts = name.splitn(3, ':');
        assert_eq!(parts.next(), Some("redhat.com"));
        assert_eq!(parts.next(), Some("imagefactory"));
        assert!(Uuid::parse_str(parts.next().unwrap()).is_ok());
    }

    #[test]
    fn test_method_request_frame_parsing() {
        let frame: Frame = serde_json::from_value(json!({
            "kind": "method_request",
            "handle": 9,
            "method": "abort_build",
            "addr": {"_object_name": "build_adaptor:image:1", "_agent_name": "a", "_agent_epoch": 3}
        }))
        .unwrap();

        match frame {
            Frame::MethodRequest { handle, method, args, addr, user_id, .. } => {
                assert_eq!(handle, 9);
                assert_eq!(method, "abort_build");
                assert!(args.is_empty());
                assert!(user_id.is_empty());
                assert_eq!(addr, DataAddr::new("build_adaptor:image:1", "a", 3));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_response_frame_shape() {
        let mut out_args = Args::new();
        out_args.insert("states".to_string(), json!({}));
        let value = serde_json::to_value(Frame::MethodResponse { handle: 4, out_args }).unwrap();
        assert_eq!(value, json!({"kind": "method_response", "handle": 4, "out_args": {"states": {}}}));
    }

    #[tokio::test]
    async fn test_memory_session_records() {
        let (mut session, sender) = MemorySession::new();

        // Closed sessions refuse to publish
        let object = DataObject::new("Thing", Args::new());
        assert!(session.add_data(object.clone(), "thing", false).await.is_err());

        session.open().await.unwrap();
        let addr = session.add_data(object, "thing", true).await.unwrap();
        assert_eq!(addr.name, "thing");
        assert_eq!(addr.agent_name, session.agent_name());
        assert!(session.published()[0].persistent);

        let id = sender.call(&addr, "poke", json!({"n": 1})).unwrap();
        let call = session.next_call().await.unwrap();
        assert_eq!(call.handle.id, id);
        assert_eq!(call.args["n"], json!(1));

        session.raise_exception(call.handle, "nope").await.unwrap();
        assert_eq!(
            session.response(id),
            Some(&Response::Exception { handle: id, message: "nope".to_string() })
        );

        session
            .raise_event(&AgentEvent {
                class_name: "status".to_string(),
                severity: Severity::Notice,
                properties: Args::new(),
            })
            .await
            .unwrap();
        assert_eq!(session.events().len(), 1);

        session.close().await.unwrap();
        assert!(session.next_call().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_session_failure_flags() {
        let (mut session, _sender) = MemorySession::new();
        session.set_fail_open(true);
        assert!(session.open().await.is_err());

        session.set_fail_open(false);
        session.open().await.unwrap();

        session.set_add_data_budget(Some(1));
        let object = DataObject::new("Thing", Args::new());
        assert!(session.add_data(object.clone(), "one", false).await.is_ok());
        assert!(session.add_data(object.clone(), "two", false).await.is_err());
        session.set_add_data_budget(None);
        assert!(session.add_data(object, "two", false).await.is_ok());
        assert_eq!(session.published().len(), 2);

        session.set_fail_close(true);
        assert!(session.close().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_session_update_replaces_object() {
        let (mut session, _sender) = MemorySession::new();
        session.open().await.unwrap();

        let mut props = Args::new();
        props.insert("status".to_string(), json!("BUILDING"));
        let addr = session
            .add_data(DataObject::new("Thing", props.clone()), "thing", true)
            .await
            .unwrap();

        props.insert("status".to_string(), json!("COMPLETED"));
        session
            .update_data(&addr, DataObject::new("Thing", props))
            .await
            .unwrap();

        assert_eq!(session.published().len(), 1);
        let entry = session.published_at(&addr).unwrap();
        assert_eq!(entry.object.properties["status"], "COMPLETED");
        assert!(entry.persistent);

        let missing = DataAddr::new("gone", session.agent_name(), session.epoch());
        let object = DataObject::new("Thing", Args::new());
        assert!(session.update_data(&missing, object).await.is_err());
    }

    #[tokio::test]
    async fn test_broker_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);

            let open: Frame = next_frame(&mut reader).await;
            let agent = match open {
                Frame::AgentOpen { agent, vendor, product, .. } => {
                    assert_eq!(vendor, VENDOR);
                    assert_eq!(product, PRODUCT);
                    agent
                }
                other => panic!("expected agent_open, got {:?}", other),
            };

            let data: Frame = next_frame(&mut reader).await;
            let addr = match data {
                Frame::Data { addr, persistent, .. } => {
                    assert!(!persistent);
                    addr
                }
                other => panic!("expected data, got {:?}", other),
            };
            assert_eq!(addr.agent_name, agent);

            let request = Frame::MethodRequest {
                handle: 1,
                method: "poke".to_string(),
                args: Args::new(),
                subtypes: Args::new(),
                addr,
                user_id: "admin".to_string(),
            };
            let body = serde_json::to_string(&request).unwrap();
            write_half.write_all(encode_frame(&body).as_bytes()).await.unwrap();

            let response: Frame = next_frame(&mut reader).await;
            let close: Frame = next_frame(&mut reader).await;
            (response, close)
        });

        let mut session = BrokerSession::new(
            ConnectionTarget::new("127.0.0.1", port),
            ConnectionOptions::default(),
        );
        session.open().await.unwrap();
        session
            .add_data(DataObject::new("Thing", Args::new()), "thing", false)
            .await
            .unwrap();

        let call = session.next_call().await.unwrap();
        assert_eq!(call.method_name, "poke");
        assert_eq!(call.user_id, "admin");

        let mut handle = call.handle;
        handle.add_return_argument("ok", json!(true));
        session.method_success(handle).await.unwrap();
        session.close().await.unwrap();

        let (response, close) = broker.await.unwrap();
        assert_eq!(
            response,
            Frame::MethodResponse {
                handle: 1,
                out_args: json!({"ok": true}).as_object().unwrap().clone(),
            }
        );
        assert!(matches!(close, Frame::AgentClose { .. }));

        // Closed sessions do not reconnect
        assert!(!session.reconnect().await.unwrap());
    }
}
