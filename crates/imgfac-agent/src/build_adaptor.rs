//! Build adaptors: managed objects that represent one in-progress build.
//!
//! An adaptor is created by an image factory method, published on the bus
//! by the dispatcher, and updated from `BuildNotice`s as the build runs.
//! Status and progress changes queue events that the dispatcher raises on
//! the bus.

use crate::launcher::{BuildJob, BuildOperation, BuildTicket, NoticeKind};
use crate::object::{Handler, ManagedObject, MethodOutcome};
use crate::schema::{DataType, Direction, Schema, SchemaMethod, Severity};
use crate::types::{AgentError, AgentEvent, Args, DataAddr};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

pub const STATUS_EVENT: &str = "status";
pub const PERCENTAGE_EVENT: &str = "percentage";
pub const BUILD_FAILED_EVENT: &str = "build_failed";

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    New,
    Building,
    Pushing,
    Completed,
    Failed,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 5] = [
        BuildStatus::New,
        BuildStatus::Building,
        BuildStatus::Pushing,
        BuildStatus::Completed,
        BuildStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::New => "NEW",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Pushing => "PUSHING",
            BuildStatus::Completed => "COMPLETED",
            BuildStatus::Failed => "FAILED",
        }
    }

    /// States reachable from this one.
    pub fn next_states(&self) -> &'static [BuildStatus] {
        match self {
            BuildStatus::New => &[BuildStatus::Building, BuildStatus::Pushing, BuildStatus::Failed],
            BuildStatus::Building | BuildStatus::Pushing => {
                &[BuildStatus::Completed, BuildStatus::Failed]
            }
            BuildStatus::Completed | BuildStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        self.next_states().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.next_states().is_empty()
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AgentError::Other(format!("Unknown build status: {}", s)))
    }
}

/// Transition table published through `instance_states`.
pub fn state_table() -> Value {
    let table: serde_json::Map<String, Value> = BuildStatus::ALL
        .iter()
        .map(|status| {
            let next: Vec<&str> = status.next_states().iter().map(|s| s.as_str()).collect();
            (status.as_str().to_string(), json!(next))
        })
        .collect();
    Value::Object(table)
}

/// Schemas of the events build adaptors raise.
pub fn event_schemas() -> Vec<Schema> {
    vec![
        Schema::event(STATUS_EVENT, Severity::Notice)
            .property("addr", DataType::Map, "address of the build adaptor")
            .property("event", DataType::Sstr, "event type")
            .property("new_status", DataType::Sstr, "status after the change")
            .property("old_status", DataType::Sstr, "status before the change"),
        Schema::event(PERCENTAGE_EVENT, Severity::Notice)
            .property("addr", DataType::Map, "address of the build adaptor")
            .property("event", DataType::Sstr, "event type")
            .property("percent_complete", DataType::Uint32, "build progress"),
        Schema::event(BUILD_FAILED_EVENT, Severity::Error)
            .property("addr", DataType::Map, "address of the build adaptor")
            .property("event", DataType::Sstr, "event type")
            .property("type", DataType::Sstr, "kind of failure")
            .property("info", DataType::Lstr, "failure details"),
    ]
}

/// A build in progress, exposed on the bus.
#[derive(Debug)]
pub struct BuildAdaptor {
    job: BuildJob,
    status: BuildStatus,
    percent_complete: u32,
    addr: Option<DataAddr>,
    ticket: Option<BuildTicket>,
    pending_events: Vec<AgentEvent>,
}

impl BuildAdaptor {
    pub fn new(job: BuildJob) -> Self {
        Self {
            job,
            status: BuildStatus::New,
            percent_complete: 0,
            addr: None,
            ticket: None,
            pending_events: Vec::new(),
        }
    }

    /// Identifier of the image this build produces.
    pub fn new_image_id(&self) -> &str {
        &self.job.new_image_id
    }

    pub fn operation(&self) -> BuildOperation {
        self.job.operation
    }

    pub fn job(&self) -> &BuildJob {
        &self.job
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn percent_complete(&self) -> u32 {
        self.percent_complete
    }

    /// Bus address, once published.
    pub fn addr(&self) -> Option<&DataAddr> {
        self.addr.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn set_addr(&mut self, addr: DataAddr) {
        self.addr = Some(addr);
    }

    pub(crate) fn attach_ticket(&mut self, ticket: BuildTicket) {
        self.ticket = Some(ticket);
    }

    /// Stop the underlying build, if one was launched.
    pub fn cancel(&self) {
        if let Some(ref ticket) = self.ticket {
            ticket.cancel();
        }
    }

    /// Move to `next`, queueing a status event.
    ///
    /// Transitions the state table does not allow are logged and ignored.
    pub fn set_status(&mut self, next: BuildStatus) {
        if next == self.status {
            return;
        }
        if !self.status.can_transition_to(next) {
            warn!(
                image_id = %self.job.new_image_id,
                from = %self.status,
                to = %next,
                "Ignoring invalid build status transition"
            );
            return;
        }

        let old = self.status;
        self.status = next;
        info!(image_id = %self.job.new_image_id, from = %old, to = %next, "Build status changed");

        let mut props = Args::new();
        props.insert("event".to_string(), json!("STATUS"));
        props.insert("new_status".to_string(), json!(next.as_str()));
        props.insert("old_status".to_string(), json!(old.as_str()));
        self.queue_event(STATUS_EVENT, Severity::Notice, props);

        if next == BuildStatus::Completed {
            self.set_percent_complete(100);
        }
    }

    pub fn set_percent_complete(&mut self, percent: u32) {
        let percent = percent.min(100);
        if percent == self.percent_complete {
            return;
        }
        self.percent_complete = percent;

        let mut props = Args::new();
        props.insert("event".to_string(), json!("PERCENTAGE"));
        props.insert("percent_complete".to_string(), json!(percent));
        self.queue_event(PERCENTAGE_EVENT, Severity::Notice, props);
    }

    /// Record a failure and move to `FAILED`.
    pub fn build_failed(&mut self, error_type: &str, info: &str) {
        if self.status.is_terminal() {
            return;
        }

        let mut props = Args::new();
        props.insert("event".to_string(), json!("FAILURE"));
        props.insert("type".to_string(), json!(error_type));
        props.insert("info".to_string(), json!(info));
        self.queue_event(BUILD_FAILED_EVENT, Severity::Error, props);

        self.set_status(BuildStatus::Failed);
    }

    /// Apply progress reported by the launcher.
    pub fn apply_notice(&mut self, kind: NoticeKind) {
        match kind {
            NoticeKind::Status(status) => self.set_status(status),
            NoticeKind::Percent(percent) => self.set_percent_complete(percent),
            NoticeKind::Failed { error_type, info } => self.build_failed(&error_type, &info),
            NoticeKind::Exited { success } => {
                if self.status.is_terminal() {
                    return;
                }
                if success {
                    self.set_status(BuildStatus::Completed);
                } else {
                    self.build_failed("BuildProcessExited", "builder exited without completing the build");
                }
            }
        }
    }

    /// Drain queued events, stamped with this adaptor's address.
    pub fn take_events(&mut self) -> Vec<AgentEvent> {
        let addr = self
            .addr
            .as_ref()
            .map(DataAddr::as_map)
            .unwrap_or(Value::Null);

        std::mem::take(&mut self.pending_events)
            .into_iter()
            .map(|mut event| {
                event.properties.insert("addr".to_string(), addr.clone());
                event
            })
            .collect()
    }

    fn queue_event(&mut self, class_name: &str, severity: Severity, properties: Args) {
        self.pending_events.push(AgentEvent {
            class_name: class_name.to_string(),
            severity,
            properties,
        });
    }

    fn abort_build(&mut self, _args: &Args) -> Result<MethodOutcome, AgentError> {
        if self.status.is_terminal() {
            return Err(AgentError::Invocation(format!(
                "Build {} already finished with status {}",
                self.job.new_image_id, self.status
            )));
        }

        debug!(image_id = %self.job.new_image_id, "Aborting build");
        self.cancel();
        self.build_failed("BuildAborted", "build aborted by request");
        Ok(MethodOutcome::Empty)
    }
}

impl ManagedObject for BuildAdaptor {
    type Outcome = MethodOutcome;
    const CLASS_NAME: &'static str = "BuildAdaptor";

    fn schema() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::data("BuildAdaptor", "A build or push of an image in progress")
                .property("image", DataType::Sstr, "UUID of the image")
                .property("build", DataType::Sstr, "UUID of the build")
                .property("image_id", DataType::Sstr, "UUID of the image being produced")
                .property("template", DataType::Lstr, "template the image is built from")
                .property("target", DataType::Sstr, "cloud the image is built for")
                .property("provider", DataType::Sstr, "provider the image is pushed to")
                .property("status", DataType::Sstr, "current build status")
                .property("percent_complete", DataType::Uint32, "build progress")
                .method(SchemaMethod::new("abort_build", "Stop the build"))
                .method(
                    SchemaMethod::new("instance_states", "Valid states of a build")
                        .arg("class_name", DataType::Sstr, Direction::In, "class to describe")
                        .arg("states", DataType::Map, Direction::Out, "state transition table"),
                )
        })
    }

    fn handler(method: &str) -> Option<Handler<Self, MethodOutcome>> {
        let handler: Handler<Self, MethodOutcome> = match method {
            "abort_build" => Self::abort_build,
            "instance_states" => instance_states_for_adaptor,
            _ => return None,
        };
        Some(handler)
    }

    fn properties(&self) -> Args {
        let mut props = Args::new();
        props.insert("image".to_string(), json!(self.job.image));
        props.insert("build".to_string(), json!(self.job.build));
        props.insert("image_id".to_string(), json!(self.job.new_image_id));
        props.insert("template".to_string(), json!(self.job.template));
        props.insert("target".to_string(), json!(self.job.target));
        props.insert("provider".to_string(), json!(self.job.provider));
        props.insert("status".to_string(), json!(self.status.as_str()));
        props.insert("percent_complete".to_string(), json!(self.percent_complete));
        props
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstanceStatesParams {
    class_name: String,
}

/// `instance_states` for callers holding an adaptor address.
fn instance_states_for_adaptor(
    _adaptor: &mut BuildAdaptor,
    args: &Args,
) -> Result<MethodOutcome, AgentError> {
    let params: InstanceStatesParams = crate::types::parse_args("instance_states", args)?;
    instance_states(&params.class_name)
}

/// Transition table for `class_name`.
pub(crate) fn instance_states(class_name: &str) -> Result<MethodOutcome, AgentError> {
    if class_name != BuildAdaptor::CLASS_NAME {
        return Err(AgentError::Invocation(format!(
            "No state table for class {}",
            class_name
        )));
    }

    let mut fields = Args::new();
    fields.insert("states".to_string(), state_table());
    Ok(MethodOutcome::Fields(fields))
}
