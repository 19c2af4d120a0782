//! Method tables for objects exposed on the bus.
//!
//! Every exposed class maps method names to typed handler functions. A call
//! for a name missing from the table fails with `AgentError::NoSuchMethod`;
//! a handler returns an explicit outcome instead of an arbitrary value so the
//! dispatcher can shape the response without inspecting types at runtime.

use crate::schema::Schema;
use crate::types::{AgentError, Args, DataObject};

/// Handler bound to one method name of `T`.
pub type Handler<T, R> = fn(&mut T, &Args) -> Result<R, AgentError>;

/// Result of a plain method.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOutcome {
    /// Named values handed back as out-arguments.
    Fields(Args),
    /// The method produced nothing.
    Empty,
}

impl MethodOutcome {
    /// Out-arguments carried by this outcome, if there are any.
    ///
    /// An empty mapping counts as no result at all.
    pub fn into_fields(self) -> Option<Args> {
        match self {
            MethodOutcome::Fields(fields) if !fields.is_empty() => Some(fields),
            _ => None,
        }
    }
}

/// An object class that can be invoked by method name.
pub trait ManagedObject: Sized {
    /// What handlers of this class return.
    type Outcome;

    /// Class name advertised in the schema.
    const CLASS_NAME: &'static str;

    /// Schema describing this class's properties and methods.
    fn schema() -> &'static Schema;

    /// Look up the handler for `method`.
    fn handler(method: &str) -> Option<Handler<Self, Self::Outcome>>;

    /// Current property values, as published on the bus.
    fn properties(&self) -> Args;

    fn data_object(&self) -> DataObject {
        DataObject::new(Self::CLASS_NAME, self.properties())
    }

    /// Invoke `method` with keyword arguments `args`.
    fn invoke(&mut self, method: &str, args: &Args) -> Result<Self::Outcome, AgentError> {
        let handler = Self::handler(method).ok_or_else(|| AgentError::NoSuchMethod {
            class: Self::CLASS_NAME.to_string(),
            method: method.to_string(),
        })?;
        handler(self, args)
    }

    /// Error describing the out-arguments `method` should have produced, or
    /// `None` when the schema declares none.
    fn missing_outputs(method: &str) -> Option<AgentError> {
        let outputs = Self::schema().output_arguments(method);
        if outputs.is_empty() {
            return None;
        }

        let expected = outputs
            .iter()
            .map(|(name, desc)| format!("'{}': '{}'", name, desc))
            .collect::<Vec<_>>()
            .join(", ");

        Some(AgentError::ContractViolation {
            method: method.to_string(),
            class: Self::CLASS_NAME.to_string(),
            expected: format!("{{{}}}", expected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Direction, SchemaMethod};
    use serde_json::json;
    use std::sync::OnceLock;

    struct Counter {
        count: u64,
    }

    impl Counter {
        fn bump(&mut self, _args: &Args) -> Result<MethodOutcome, AgentError> {
            self.count += 1;
            Ok(MethodOutcome::Empty)
        }

        fn read(&mut self, _args: &Args) -> Result<MethodOutcome, AgentError> {
            let mut fields = Args::new();
            fields.insert("count".to_string(), json!(self.count));
            Ok(MethodOutcome::Fields(fields))
        }
    }

    impl ManagedObject for Counter {
        type Outcome = MethodOutcome;
        const CLASS_NAME: &'static str = "Counter";

        fn schema() -> &'static Schema {
            static SCHEMA: OnceLock<Schema> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                Schema::data("Counter", "test counter")
                    .method(SchemaMethod::new("bump", "increment"))
                    .method(
                        SchemaMethod::new("read", "current value")
                            .arg("count", DataType::Uint32, Direction::Out, "the count"),
                    )
            })
        }

        fn handler(method: &str) -> Option<Handler<Self, MethodOutcome>> {
            let handler: Handler<Self, MethodOutcome> = match method {
                "bump" => Self::bump,
                "read" => Self::read,
                _ => return None,
            };
            Some(handler)
        }

        fn properties(&self) -> Args {
            let mut props = Args::new();
            props.insert("count".to_string(), json!(self.count));
            props
        }
    }

    #[test]
    fn test_invoke_routes_by_name() {
        let mut counter = Counter { count: 0 };
        assert_eq!(counter.invoke("bump", &Args::new()).unwrap(), MethodOutcome::Empty);
        let fields = counter.invoke("read", &Args::new()).unwrap().into_fields().unwrap();
        assert_eq!(fields["count"], json!(1));
    }

    #[test]
    fn test_invoke_unknown_method() {
        let mut counter = Counter { count: 0 };
        let err = counter.invoke("explode", &Args::new()).unwrap_err();
        assert!(matches!(err, AgentError::NoSuchMethod { .. }));
        assert_eq!(err.to_string(), "'Counter' object has no method 'explode'");
    }

    #[test]
    fn test_missing_outputs() {
        assert!(Counter::missing_outputs("bump").is_none());

        let err = Counter::missing_outputs("read").unwrap();
        assert_eq!(
            err.to_string(),
            "Method 'read' on objects of class Counter must return a dictionary of {'count': 'the count'}"
        );
    }

    #[test]
    fn test_empty_fields_count_as_no_result() {
        assert!(MethodOutcome::Fields(Args::new()).into_fields().is_none());
        assert!(MethodOutcome::Empty.into_fields().is_none());
    }

    #[test]
    fn test_data_object_snapshot() {
        let counter = Counter { count: 3 };
        let data = counter.data_object();
        assert_eq!(data.class_name, "Counter");
        assert_eq!(data.properties["count"], json!(3));
    }
}
