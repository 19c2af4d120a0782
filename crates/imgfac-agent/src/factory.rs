//! The image factory: the root object every agent publishes.
//!
//! Factory methods either start builds, returning the build adaptors that
//! track them, or answer with a plain mapping.

use crate::build_adaptor::{self, BuildAdaptor};
use crate::launcher::{BuildJob, BuildLauncher, BuildOperation, Credentials, NoticeSender};
use crate::object::{Handler, ManagedObject, MethodOutcome};
use crate::schema::{DataType, Direction, Schema, SchemaMethod};
use crate::types::{parse_args, AgentError, Args};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of an image factory method.
#[derive(Debug)]
pub enum FactoryOutcome {
    Plain(MethodOutcome),
    /// One build was started (`image`, `provider_image`).
    Adaptor(BuildAdaptor),
    /// One build per target or provider (`build_image`, `push_image`).
    Adaptors(Vec<BuildAdaptor>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageParams {
    template: String,
    target: String,
    #[serde(default)]
    image_id: String,
    #[serde(default)]
    build_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProviderImageParams {
    image_id: String,
    build_id: String,
    target: String,
    provider: String,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildImageParams {
    #[serde(default)]
    image: String,
    #[serde(default)]
    build: String,
    template: String,
    targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PushImageParams {
    image: String,
    build: String,
    providers: Vec<String>,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstanceStatesParams {
    class_name: String,
}

/// The root factory object.
pub struct ImageFactory {
    launcher: Arc<dyn BuildLauncher>,
    notices: NoticeSender,
}

impl ImageFactory {
    pub fn new(launcher: Arc<dyn BuildLauncher>, notices: NoticeSender) -> Self {
        Self { launcher, notices }
    }

    fn image(&mut self, args: &Args) -> Result<FactoryOutcome, AgentError> {
        let params: ImageParams = parse_args("image", args)?;
        let job = BuildJob {
            operation: BuildOperation::Image,
            new_image_id: new_id(),
            image: or_new_id(params.image_id),
            build: or_new_id(params.build_id),
            template: Some(params.template),
            target: Some(params.target),
            provider: None,
            credentials: None,
        };
        Ok(FactoryOutcome::Adaptor(self.start_build(job)?))
    }

    fn provider_image(&mut self, args: &Args) -> Result<FactoryOutcome, AgentError> {
        let params: ProviderImageParams = parse_args("provider_image", args)?;
        let job = BuildJob {
            operation: BuildOperation::ProviderImage,
            new_image_id: new_id(),
            image: params.image_id,
            build: params.build_id,
            template: None,
            target: Some(params.target),
            provider: Some(params.provider),
            credentials: Some(params.credentials),
        };
        Ok(FactoryOutcome::Adaptor(self.start_build(job)?))
    }

    fn build_image(&mut self, args: &Args) -> Result<FactoryOutcome, AgentError> {
        let params: BuildImageParams = parse_args("build_image", args)?;
        let image = or_new_id(params.image);
        let build = or_new_id(params.build);

        let jobs = params
            .targets
            .into_iter()
            .map(|target| BuildJob {
                operation: BuildOperation::BuildImage,
                new_image_id: new_id(),
                image: image.clone(),
                build: build.clone(),
                template: Some(params.template.clone()),
                target: Some(target),
                provider: None,
                credentials: None,
            })
            .collect();
        Ok(FactoryOutcome::Adaptors(self.start_builds(jobs)?))
    }

    fn push_image(&mut self, args: &Args) -> Result<FactoryOutcome, AgentError> {
        let params: PushImageParams = parse_args("push_image", args)?;

        let jobs = params
            .providers
            .into_iter()
            .map(|provider| BuildJob {
                operation: BuildOperation::PushImage,
                new_image_id: new_id(),
                image: params.image.clone(),
                build: params.build.clone(),
                template: None,
                target: None,
                provider: Some(provider),
                credentials: Some(params.credentials.clone()),
            })
            .collect();
        Ok(FactoryOutcome::Adaptors(self.start_builds(jobs)?))
    }

    fn instance_states(&mut self, args: &Args) -> Result<FactoryOutcome, AgentError> {
        let params: InstanceStatesParams = parse_args("instance_states", args)?;
        build_adaptor::instance_states(&params.class_name).map(FactoryOutcome::Plain)
    }

    fn start_build(&self, job: BuildJob) -> Result<BuildAdaptor, AgentError> {
        debug!(operation = ?job.operation, image_id = %job.new_image_id, "Launching build");
        let mut adaptor = BuildAdaptor::new(job.clone());
        let ticket = self.launcher.launch(job, self.notices.clone())?;
        adaptor.attach_ticket(ticket);
        adaptor.set_status(adaptor.operation().active_status());
        Ok(adaptor)
    }

    /// Start every job, or none: builds already started are cancelled when a
    /// later one fails to launch.
    fn start_builds(&self, jobs: Vec<BuildJob>) -> Result<Vec<BuildAdaptor>, AgentError> {
        let mut adaptors = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.start_build(job) {
                Ok(adaptor) => adaptors.push(adaptor),
                Err(e) => {
                    warn!(started = adaptors.len(), error = %e, "Launch failed, cancelling started builds");
                    for adaptor in &adaptors {
                        adaptor.cancel();
                    }
                    return Err(e);
                }
            }
        }
        Ok(adaptors)
    }
}

impl ManagedObject for ImageFactory {
    type Outcome = FactoryOutcome;
    const CLASS_NAME: &'static str = "ImageFactory";

    fn schema() -> &'static Schema {
        static SCHEMA: OnceLock<Schema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            let adaptor_out = "the address of the build_adaptor instantiated";
            let adaptors_out = "list of addresses of the build_adaptors instantiated";

            Schema::data("ImageFactory", "Builds images and pushes them to cloud providers")
                .method(
                    SchemaMethod::new("image", "Build a new image for a target cloud")
                        .arg("template", DataType::Lstr, Direction::In, "string of xml, uuid, or url")
                        .arg("target", DataType::Sstr, Direction::In, "name of the cloud to target")
                        .arg("image_id", DataType::Sstr, Direction::In, "UUID of an existing image")
                        .arg("build_id", DataType::Sstr, Direction::In, "UUID of an existing build")
                        .arg("build_adaptor", DataType::Map, Direction::Out, adaptor_out),
                )
                .method(
                    SchemaMethod::new("provider_image", "Push an image to a provider")
                        .arg("image_id", DataType::Sstr, Direction::In, "UUID of the target image")
                        .arg("build_id", DataType::Sstr, Direction::In, "UUID of the build")
                        .arg("target", DataType::Sstr, Direction::In, "name of the cloud to target")
                        .arg("provider", DataType::Sstr, Direction::In, "name of the cloud provider")
                        .arg("credentials", DataType::Lstr, Direction::In, "provider credentials")
                        .arg("build_adaptor", DataType::Map, Direction::Out, adaptor_out),
                )
                .method(
                    SchemaMethod::new("build_image", "Build an image for several targets")
                        .arg("image", DataType::Sstr, Direction::In, "UUID of an existing image")
                        .arg("build", DataType::Sstr, Direction::In, "UUID of an existing build")
                        .arg("template", DataType::Lstr, Direction::In, "string of xml, uuid, or url")
                        .arg("targets", DataType::List, Direction::In, "names of the clouds to target")
                        .arg("build_adaptors", DataType::List, Direction::Out, adaptors_out),
                )
                .method(
                    SchemaMethod::new("push_image", "Push an image to several providers")
                        .arg("image", DataType::Sstr, Direction::In, "UUID of the image")
                        .arg("build", DataType::Sstr, Direction::In, "UUID of the build")
                        .arg("providers", DataType::List, Direction::In, "names of the cloud providers")
                        .arg("credentials", DataType::Lstr, Direction::In, "provider credentials")
                        .arg("build_adaptors", DataType::List, Direction::Out, adaptors_out),
                )
                .method(
                    SchemaMethod::new("instance_states", "Valid states of a managed class")
                        .arg("class_name", DataType::Sstr, Direction::In, "class to describe")
                        .arg("states", DataType::Map, Direction::Out, "state transition table"),
                )
        })
    }

    fn handler(method: &str) -> Option<Handler<Self, FactoryOutcome>> {
        let handler: Handler<Self, FactoryOutcome> = match method {
            "image" => Self::image,
            "provider_image" => Self::provider_image,
            "build_image" => Self::build_image,
            "push_image" => Self::push_image,
            "instance_states" => Self::instance_states,
            _ => return None,
        };
        Some(handler)
    }

    fn properties(&self) -> Args {
        let mut props = Args::new();
        props.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        props
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn or_new_id(id: String) -> String {
    if id.is_empty() {
        new_id()
    } else {
        id
    }
}
