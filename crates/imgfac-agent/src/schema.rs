//! Class schemas advertised to the management bus.
//!
//! A schema describes the properties, methods and argument directions of an
//! object class (or the payload of an event class). The dispatcher consults
//! them to tell callers which out-arguments a method was supposed to produce.

use serde::{Deserialize, Serialize};

/// Package all imagefactory schemas are registered under.
pub const SCHEMA_PACKAGE: &str = "com.redhat.imagefactory";

/// Direction of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn is_output(&self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// Wire type of a property or argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Uint32,
    Sstr,
    Lstr,
    Map,
    List,
}

/// Whether a schema describes published objects or emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Data,
    Event,
}

/// Severity attached to events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Notice,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaArgument {
    pub name: String,
    pub data_type: DataType,
    pub direction: Direction,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaMethod {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<SchemaArgument>,
}

impl SchemaMethod {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            arguments: Vec::new(),
        }
    }

    pub fn arg(
        mut self,
        name: &str,
        data_type: DataType,
        direction: Direction,
        description: &str,
    ) -> Self {
        self.arguments.push(SchemaArgument {
            name: name.to_string(),
            data_type,
            direction,
            description: description.to_string(),
        });
        self
    }

    /// Arguments the method hands back to its caller.
    pub fn output_arguments(&self) -> impl Iterator<Item = &SchemaArgument> {
        self.arguments.iter().filter(|a| a.direction.is_output())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaProperty {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub description: String,
}

/// Schema of one object or event class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub kind: SchemaKind,
    pub package: String,
    pub class_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_severity: Option<Severity>,
    #[serde(default)]
    pub properties: Vec<SchemaProperty>,
    #[serde(default)]
    pub methods: Vec<SchemaMethod>,
}

impl Schema {
    /// Schema for a class of published objects.
    pub fn data(class_name: &str, description: &str) -> Self {
        Self {
            kind: SchemaKind::Data,
            package: SCHEMA_PACKAGE.to_string(),
            class_name: class_name.to_string(),
            description: description.to_string(),
            default_severity: None,
            properties: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Schema for a class of events.
    pub fn event(class_name: &str, severity: Severity) -> Self {
        Self {
            kind: SchemaKind::Event,
            default_severity: Some(severity),
            ..Self::data(class_name, "")
        }
    }

    pub fn property(mut self, name: &str, data_type: DataType, description: &str) -> Self {
        self.properties.push(SchemaProperty {
            name: name.to_string(),
            data_type,
            description: description.to_string(),
        });
        self
    }

    pub fn method(mut self, method: SchemaMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn find_method(&self, name: &str) -> Option<&SchemaMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// `(name, description)` of every out-argument declared for `method`.
    ///
    /// Empty when the method is unknown or declares no outputs.
    pub fn output_arguments(&self, method: &str) -> Vec<(String, String)> {
        self.find_method(method)
            .map(|m| {
                m.output_arguments()
                    .map(|a| (a.name.clone(), a.description.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::data("Sample", "a sample class")
            .property("status", DataType::Sstr, "current status")
            .method(
                SchemaMethod::new("fetch", "fetch things")
                    .arg("what", DataType::Sstr, Direction::In, "thing to fetch")
                    .arg("result", DataType::Map, Direction::Out, "fetched thing")
                    .arg("cursor", DataType::Sstr, Direction::InOut, "paging cursor"),
            )
            .method(SchemaMethod::new("reset", "no outputs"))
    }

    #[test]
    fn test_output_arguments() {
        let schema = sample();
        let outs = schema.output_arguments("fetch");
        assert_eq!(
            outs,
            vec![
                ("result".to_string(), "fetched thing".to_string()),
                ("cursor".to_string(), "paging cursor".to_string()),
            ]
        );
        assert!(schema.output_arguments("reset").is_empty());
        assert!(schema.output_arguments("missing").is_empty());
    }

    #[test]
    fn test_event_schema_defaults() {
        let schema = Schema::event("status", Severity::Notice);
        assert_eq!(schema.kind, SchemaKind::Event);
        assert_eq!(schema.package, SCHEMA_PACKAGE);
        assert_eq!(schema.default_severity, Some(Severity::Notice));
    }

    #[test]
    fn test_schema_serialization() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["kind"], "data");
        assert_eq!(json["methods"][0]["arguments"][1]["direction"], "OUT");
        assert!(json.get("default_severity").is_none());
    }
}
