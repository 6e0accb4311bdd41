//! Definition steps and the documents that carry them.
//!
//! A [`Step`] is one entry of a definition sequence. The `kind` discriminator
//! selects the resolver; every other key of the authored object lands in
//! [`Step::properties`]. The keys `kind`, `dependencies`, and `requiredArgs`
//! are reserved.
//!
//! ```rust
//! use stepwise_types::Step;
//! use serde_json::json;
//!
//! let step: Step = serde_json::from_value(json!({
//!     "kind": "fetch",
//!     "url": "https://example.com/items.json",
//!     "requiredArgs": ["url"]
//! })).expect("valid step");
//!
//! assert_eq!(step.kind, "fetch");
//! assert_eq!(step.property("url"), Some(&json!("https://example.com/items.json")));
//! assert!(step.required_args.is_some());
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map as JsonMap, Value};

/// One entry of a definition sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Discriminator used to look up the resolver for this step.
    pub kind: String,
    /// Nested pipelines resolved before this step's handler runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    /// Names that must be available before the wrapped handler runs.
    ///
    /// `None` disables the required-argument gate entirely; an empty list is
    /// always satisfied.
    #[serde(default, rename = "requiredArgs", skip_serializing_if = "Option::is_none")]
    pub required_args: Option<Vec<String>>,
    /// Resolver-specific parameters.
    #[serde(flatten)]
    pub properties: JsonMap<String, Value>,
}

impl Step {
    /// Create a step of the given kind with no properties.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Builder-style helper that sets a property.
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Builder-style helper that appends a dependency.
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Builder-style helper that sets the required-argument list.
    pub fn with_required_args<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_args = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the named property, if present.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Returns `true` when the named property is present (even if `null`).
    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Returns `true` when this step declares at least one dependency.
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Decode the step's properties into a strongly typed payload.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(Value::Object(self.properties.clone()))
    }

    /// Whether `name` is a key of the step as written: `kind`, `requiredArgs`
    /// and `dependencies` when present, or any property.
    pub fn has_key(&self, name: &str) -> bool {
        match name {
            "kind" => true,
            "requiredArgs" => self.required_args.is_some(),
            "dependencies" => self.has_dependencies(),
            _ => self.has_property(name),
        }
    }

    /// Produce a derived copy with each resolved `(name, value)` set as a
    /// property, leaving `self` untouched.
    ///
    /// Dependencies are dropped from the copy because they have already been
    /// resolved into properties by the time a derived step exists.
    pub fn merged_with(&self, resolved: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut derived = self.clone();
        derived.dependencies.clear();
        derived.properties.extend(resolved);
        derived
    }
}

/// Nested pipeline whose result is merged into its owning step under `name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dependency {
    /// Property name the resolved value is stored under.
    pub name: String,
    /// Steps of the nested pipeline.
    #[serde(default, rename = "subSteps")]
    pub sub_steps: Vec<Step>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, sub_steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            sub_steps,
        }
    }
}

/// A pipeline definition as authored on disk.
///
/// `definition` is optional at the serde level so that a document lacking it
/// can be reported as a configuration error rather than a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineDocument {
    /// Optional human-friendly name used in logs and CLI output.
    #[serde(default)]
    pub name: Option<String>,
    /// Ordered definition steps.
    #[serde(default)]
    pub definition: Option<Vec<Step>>,
    /// Initial `previous` value handed to the first step.
    #[serde(default)]
    pub seed: Value,
}
