use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::sample::Sample;

/// Errors raised while loading or compiling resource definitions.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("reading definitions file: {0}")]
    Read(#[from] std::io::Error),

    #[error("parsing definitions: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("definition {0}: resource_type must not be empty")]
    EmptyResourceType(usize),

    #[error("definition {0:?}: metrics list must not be empty")]
    NoMetrics(String),

    #[error("definition {0:?}: empty metric pattern")]
    EmptyPattern(String),
}

/// On-disk shape of the definitions file.
#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default)]
    resources: Vec<RawDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    #[serde(default)]
    resource_type: String,

    #[serde(default)]
    metrics: Vec<String>,

    #[serde(default)]
    attributes: BTreeMap<String, serde_yaml::Value>,

    #[serde(default)]
    archive_policy: Option<String>,

    #[serde(default)]
    ignore: bool,
}

/// A compiled attribute extraction rule.
#[derive(Debug, Clone)]
enum Rule {
    /// Dotted-path lookup into the sample's JSON form.
    Lookup(Vec<String>),
    /// Fixed value attached verbatim.
    Literal(serde_json::Value),
}

/// One compiled resource definition: which metrics it claims, what
/// resource type they belong to, and how to derive attributes.
#[derive(Debug, Clone)]
pub struct ResourceDefinition {
    pub resource_type: String,
    pub archive_policy: Option<String>,
    pub ignore: bool,
    patterns: Vec<String>,
    rules: Vec<(String, Rule)>,
}

impl ResourceDefinition {
    /// True when any of the definition's patterns match the metric name.
    pub fn matches(&self, metric_name: &str) -> bool {
        self.patterns.iter().any(|p| wildcard_match(p, metric_name))
    }

    /// The metric name patterns declared for this definition.
    pub fn metric_patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Evaluate every extraction rule against the sample.
    ///
    /// Rules that resolve to nothing, either a missing path or a JSON
    /// null, are omitted rather than emitted as null attributes.
    pub fn attributes(&self, sample: &Sample) -> BTreeMap<String, serde_json::Value> {
        let doc = sample.to_json();
        let mut out = BTreeMap::new();

        for (name, rule) in &self.rules {
            let value = match rule {
                Rule::Lookup(path) => lookup(&doc, path).cloned(),
                Rule::Literal(v) => Some(v.clone()),
            };

            if let Some(v) = value {
                if !v.is_null() {
                    out.insert(name.clone(), v);
                }
            }
        }

        out
    }
}

/// The full ordered set of resource definitions.
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    defs: Vec<ResourceDefinition>,
}

impl DefinitionSet {
    /// Load and compile definitions from a YAML file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Compile definitions from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self, DefinitionError> {
        let file: DefinitionsFile = serde_yaml::from_str(data)?;

        let mut defs = Vec::with_capacity(file.resources.len());
        for (index, raw) in file.resources.into_iter().enumerate() {
            if raw.resource_type.is_empty() {
                return Err(DefinitionError::EmptyResourceType(index));
            }
            if raw.metrics.is_empty() {
                return Err(DefinitionError::NoMetrics(raw.resource_type));
            }
            if raw.metrics.iter().any(String::is_empty) {
                return Err(DefinitionError::EmptyPattern(raw.resource_type));
            }

            let rules = raw
                .attributes
                .into_iter()
                .map(|(name, value)| (name, compile_rule(value)))
                .collect();

            defs.push(ResourceDefinition {
                resource_type: raw.resource_type,
                archive_policy: raw.archive_policy,
                ignore: raw.ignore,
                patterns: raw.metrics,
                rules,
            });
        }

        Ok(Self { defs })
    }

    /// First definition whose patterns match the metric name, in file
    /// order.
    pub fn find(&self, metric_name: &str) -> Option<&ResourceDefinition> {
        self.defs.iter().find(|d| d.matches(metric_name))
    }

    /// True when any definition of the given resource type matches the
    /// metric name.
    pub fn matches_type(&self, metric_name: &str, resource_type: &str) -> bool {
        self.defs
            .iter()
            .any(|d| d.resource_type == resource_type && d.matches(metric_name))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Compile one YAML attribute value into an extraction rule.
///
/// Strings starting with "$." become dotted-path lookups; everything
/// else is carried as a literal.
fn compile_rule(value: serde_yaml::Value) -> Rule {
    if let serde_yaml::Value::String(s) = &value {
        if let Some(path) = s.strip_prefix("$.") {
            return Rule::Lookup(path.split('.').map(str::to_string).collect());
        }
    }
    Rule::Literal(yaml_to_json(value))
}

fn yaml_to_json(value: serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn lookup<'a>(doc: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = doc;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Glob-style match supporting `*` (any run, including empty) and `?`
/// (exactly one character).
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn rec(p: &[char], n: &[char]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(&'*') => (0..=n.len()).any(|skip| rec(&p[1..], &n[skip..])),
            Some(&'?') => !n.is_empty() && rec(&p[1..], &n[1..]),
            Some(c) => n.first() == Some(c) && rec(&p[1..], &n[1..]),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    rec(&pattern, &name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS: &str = r#"
resources:
  - resource_type: instance
    metrics: ["cpu_util", "disk.*"]
    attributes:
      host: "$.metadata.host"
      flavor_name: "$.metadata.flavor.name"
      zone: "az1"
    archive_policy: low
  - resource_type: instance_disk
    metrics: ["disk.device.*"]
  - resource_type: storage_account
    metrics: ["storage.objects*"]
    ignore: true
"#;

    fn sample_with_metadata(metadata: serde_json::Value) -> Sample {
        let mut sample: Sample = serde_json::from_str(
            r#"{
                "resource_id": "i-1",
                "counter_name": "cpu_util",
                "project_id": "p1",
                "user_id": "u1",
                "timestamp": "2024-01-01T00:00:00Z",
                "counter_volume": 1.0
            }"#,
        )
        .expect("sample should parse");
        sample.extra.insert("metadata".to_string(), metadata);
        sample
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("cpu_util", "cpu_util"));
        assert!(wildcard_match("disk.*", "disk.read.bytes"));
        assert!(wildcard_match("disk.*", "disk."));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("net.?x.bytes", "net.tx.bytes"));
        assert!(wildcard_match("net.?x.bytes", "net.rx.bytes"));

        assert!(!wildcard_match("cpu_util", "cpu"));
        assert!(!wildcard_match("disk.*", "cpu_util"));
        assert!(!wildcard_match("net.?x.bytes", "net.x.bytes"));
        assert!(!wildcard_match("", "cpu_util"));
    }

    #[test]
    fn test_first_matching_definition_wins() {
        let defs = DefinitionSet::from_yaml(DEFINITIONS).expect("definitions should parse");

        let d = defs.find("disk.device.read").expect("should match");
        assert_eq!(d.resource_type, "instance");

        let d = defs.find("cpu_util").expect("should match");
        assert_eq!(d.resource_type, "instance");
        assert_eq!(d.archive_policy.as_deref(), Some("low"));

        assert!(defs.find("memory.usage").is_none());
    }

    #[test]
    fn test_matches_type() {
        let defs = DefinitionSet::from_yaml(DEFINITIONS).expect("definitions should parse");

        assert!(defs.matches_type("storage.objects.count", "storage_account"));
        assert!(!defs.matches_type("cpu_util", "storage_account"));
        assert!(!defs.matches_type("memory.usage", "storage_account"));
    }

    #[test]
    fn test_attribute_extraction() {
        let defs = DefinitionSet::from_yaml(DEFINITIONS).expect("definitions should parse");
        let d = defs.find("cpu_util").expect("should match");

        let sample = sample_with_metadata(serde_json::json!({
            "host": "node-7",
            "flavor": {"name": "m1.small"},
        }));

        let attrs = d.attributes(&sample);
        assert_eq!(attrs["host"], "node-7");
        assert_eq!(attrs["flavor_name"], "m1.small");
        assert_eq!(attrs["zone"], "az1");
    }

    #[test]
    fn test_missing_and_null_attributes_omitted() {
        let defs = DefinitionSet::from_yaml(DEFINITIONS).expect("definitions should parse");
        let d = defs.find("cpu_util").expect("should match");

        let sample = sample_with_metadata(serde_json::json!({"host": null}));

        let attrs = d.attributes(&sample);
        assert!(!attrs.contains_key("host"));
        assert!(!attrs.contains_key("flavor_name"));
        assert_eq!(attrs["zone"], "az1");
    }

    #[test]
    fn test_ignore_flag_compiles() {
        let defs = DefinitionSet::from_yaml(DEFINITIONS).expect("definitions should parse");
        let d = defs.find("storage.objects.count").expect("should match");
        assert!(d.ignore);
    }

    #[test]
    fn test_empty_resource_type_rejected() {
        let err = DefinitionSet::from_yaml("resources:\n  - metrics: [\"cpu_util\"]\n")
            .expect_err("should fail");
        assert!(err.to_string().contains("resource_type"));
    }

    #[test]
    fn test_empty_metrics_rejected() {
        let err = DefinitionSet::from_yaml("resources:\n  - resource_type: instance\n")
            .expect_err("should fail");
        assert!(err.to_string().contains("metrics list"));
    }

    #[test]
    fn test_empty_resources_list_yields_empty_set() {
        let defs = DefinitionSet::from_yaml("resources: []\n").expect("should parse");
        assert!(defs.is_empty());
    }
}
