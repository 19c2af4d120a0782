//! Routes inbound method calls to the factory or a registered build adaptor
//! and turns their outcomes into bus responses.

use crate::build_adaptor::{self, BuildAdaptor};
use crate::factory::{FactoryOutcome, ImageFactory};
use crate::launcher::BuildNotice;
use crate::object::{ManagedObject, MethodOutcome};
use crate::registry::{ManagedObjects, ManagedRef};
use crate::session::BusSession;
use crate::types::{redact_args, AgentError, AgentEvent, Args, DataAddr, MethodCall, MethodHandle, FACTORY_OBJECT_NAME};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Serves one bus session: owns the image factory and every build adaptor
/// published through it.
pub struct AgentDispatcher<S: BusSession> {
    session: S,
    factory: ImageFactory,
    factory_addr: DataAddr,
    managed: ManagedObjects,
}

impl<S: BusSession> AgentDispatcher<S> {
    /// Open `session`, register every schema this agent exposes, and publish
    /// the factory.
    ///
    /// Failing to open the session is fatal; connection retries are the
    /// session's business.
    pub async fn initialize(mut session: S, factory: ImageFactory) -> Result<Self, AgentError> {
        session.open().await?;

        session.register_schema(ImageFactory::schema()).await?;
        session.register_schema(BuildAdaptor::schema()).await?;
        for schema in build_adaptor::event_schemas() {
            session.register_schema(&schema).await?;
        }

        let factory_addr = session
            .add_data(factory.data_object(), FACTORY_OBJECT_NAME, false)
            .await?;
        info!(addr = %factory_addr, "image_factory published");

        Ok(Self {
            session,
            factory,
            factory_addr,
            managed: ManagedObjects::new(),
        })
    }

    pub fn factory_addr(&self) -> &DataAddr {
        &self.factory_addr
    }

    pub fn managed(&self) -> &ManagedObjects {
        &self.managed
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Handle one method call. Every failure is answered with a bus
    /// exception; nothing is returned to the caller.
    pub async fn dispatch(&mut self, call: MethodCall) {
        let MethodCall {
            mut handle,
            method_name,
            args,
            subtypes,
            addr,
            user_id,
        } = call;

        debug!(
            method = %method_name,
            args = ?redact_args(&args),
            handle = handle.id,
            addr = %addr,
            subtypes = ?subtypes,
            user_id = %user_id,
            "Method called"
        );

        match self.route(&mut handle, &method_name, &args, &addr).await {
            Ok(()) => {
                if let Err(e) = self.session.method_success(handle).await {
                    error!(method = %method_name, error = %e, "Failed to send method response");
                }
            }
            Err(e) => {
                error!(method = %method_name, addr = %addr, error = ?e, "{}", e);
                if let Err(send_err) = self.session.raise_exception(handle, &e.to_string()).await {
                    error!(method = %method_name, error = %send_err, "Failed to send method exception");
                }
            }
        }
    }

    async fn route(
        &mut self,
        handle: &mut MethodHandle,
        method: &str,
        args: &Args,
        addr: &DataAddr,
    ) -> Result<(), AgentError> {
        if *addr == self.factory_addr {
            let outcome = self.factory.invoke(method, args)?;
            return self.shape_factory_outcome(handle, method, outcome).await;
        }

        let key = addr.key();
        let adaptor = self
            .managed
            .get_mut(&key)
            .ok_or_else(|| AgentError::UnknownObject {
                addr: key.clone(),
                method: method.to_string(),
            })?;

        let outcome = adaptor.invoke(method, args);
        self.publish_changes(&key).await;

        shape_plain::<BuildAdaptor>(handle, method, outcome?)
    }

    async fn shape_factory_outcome(
        &mut self,
        handle: &mut MethodHandle,
        method: &str,
        outcome: FactoryOutcome,
    ) -> Result<(), AgentError> {
        match outcome {
            FactoryOutcome::Adaptor(adaptor) => {
                let addr = self.publish_adaptor(method, adaptor).await?;
                handle.add_return_argument("build_adaptor", addr.as_map());
                Ok(())
            }
            FactoryOutcome::Adaptors(adaptors) => {
                let mut addrs = Vec::with_capacity(adaptors.len());
                let mut pending = adaptors.into_iter();
                while let Some(adaptor) = pending.next() {
                    match self.publish_adaptor(method, adaptor).await {
                        Ok(addr) => addrs.push(addr),
                        Err(e) => {
                            warn!(
                                published = addrs.len(),
                                error = %e,
                                "Publishing build_adaptors failed, withdrawing those already published"
                            );
                            for unpublished in pending {
                                unpublished.cancel();
                            }
                            for addr in &addrs {
                                if let Some(adaptor) = self.deregister(addr).await {
                                    adaptor.cancel();
                                }
                            }
                            return Err(e);
                        }
                    }
                }
                let addrs = addrs.iter().map(DataAddr::as_map).collect();
                handle.add_return_argument("build_adaptors", Value::Array(addrs));
                Ok(())
            }
            FactoryOutcome::Plain(outcome) => shape_plain::<ImageFactory>(handle, method, outcome),
        }
    }

    /// Publish `adaptor` as `build_adaptor:<method>:<image id>` and take
    /// ownership of it.
    async fn publish_adaptor(
        &mut self,
        method: &str,
        mut adaptor: BuildAdaptor,
    ) -> Result<DataAddr, AgentError> {
        let name = format!("build_adaptor:{}:{}", method, adaptor.new_image_id());
        let addr = match self.session.add_data(adaptor.data_object(), &name, true).await {
            Ok(addr) => addr,
            Err(e) => {
                adaptor.cancel();
                return Err(e);
            }
        };

        adaptor.set_addr(addr.clone());
        let events = adaptor.take_events();
        self.managed.insert(&addr, adaptor);
        info!(addr = %addr, "build_adaptor registered");

        self.raise_events(events).await;
        Ok(addr)
    }

    /// Apply builder progress to the adaptor tracking it. Finished builds
    /// are deregistered.
    pub async fn handle_notice(&mut self, notice: BuildNotice) {
        let Some(key) = self.managed.find_by_image_id(&notice.new_image_id) else {
            debug!(image_id = %notice.new_image_id, "Notice for a build no longer managed");
            return;
        };
        let Some(adaptor) = self.managed.get_mut(&key) else {
            return;
        };

        adaptor.apply_notice(notice.kind);
        let finished = adaptor.is_finished();

        self.publish_changes(&key).await;
        if finished {
            self.deregister(&key).await;
        }
    }

    /// Remove an adaptor from the registry and withdraw it from the bus.
    ///
    /// Accepts the adaptor, its address, or its key. Removing something that
    /// is not registered is logged and otherwise ignored.
    pub async fn deregister<'a>(&mut self, target: impl Into<ManagedRef<'a>>) -> Option<BuildAdaptor> {
        let Some(key) = target.into().key() else {
            error!("Trying to remove an unpublished object from managedObjects");
            return None;
        };

        let Some(adaptor) = self.managed.remove(&key) else {
            error!(
                "Trying to remove object ({}) from managedObjects that does not exist...",
                key
            );
            return None;
        };

        if let Some(addr) = adaptor.addr() {
            if let Err(e) = self.session.del_data(addr).await {
                warn!(addr = %addr, error = %e, "Failed to withdraw build_adaptor");
            }
        }
        info!(key = %key, status = %adaptor.status(), "build_adaptor deregistered");
        Some(adaptor)
    }

    /// Stop running builds and close the session. Returns `false` if closing
    /// failed; the error is only logged.
    pub async fn shutdown(&mut self) -> bool {
        for (key, adaptor) in self.managed.iter() {
            if !adaptor.is_finished() {
                debug!(key = %key, "Cancelling build");
                adaptor.cancel();
            }
        }

        match self.session.close().await {
            Ok(()) => {
                info!("Agent shut down");
                true
            }
            Err(e) => {
                error!(error = ?e, "Failed to close agent session: {}", e);
                false
            }
        }
    }

    /// Raise the events an adaptor queued and, if it changed, re-send its
    /// published state.
    async fn publish_changes(&mut self, key: &str) {
        let Some(adaptor) = self.managed.get_mut(key) else {
            return;
        };
        let events = adaptor.take_events();
        if events.is_empty() {
            return;
        }
        let update = adaptor.addr().cloned().map(|addr| (addr, adaptor.data_object()));

        if let Some((addr, object)) = update {
            if let Err(e) = self.session.update_data(&addr, object).await {
                warn!(addr = %addr, error = %e, "Failed to update build_adaptor");
            }
        }
        self.raise_events(events).await;
    }

    async fn raise_events(&mut self, events: Vec<AgentEvent>) {
        for event in events {
            if let Err(e) = self.session.raise_event(&event).await {
                warn!(class = %event.class_name, error = %e, "Failed to raise event");
            }
        }
    }
}

/// Copy a plain outcome into out-arguments. Producing nothing is only
/// allowed when the schema declares no outputs for `method`.
fn shape_plain<T: ManagedObject>(
    handle: &mut MethodHandle,
    method: &str,
    outcome: MethodOutcome,
) -> Result<(), AgentError> {
    match outcome.into_fields() {
        Some(fields) => {
            for (name, value) in fields {
                handle.add_return_argument(name, value);
            }
            Ok(())
        }
        None => match T::missing_outputs(method) {
            Some(violation) => Err(violation),
            None => Ok(()),
        },
    }
}
