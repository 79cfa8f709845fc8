//! Shipyard documents: the per-project pipeline definition.
//!
//! ```yaml
//! apiVersion: spec.keptn.sh/0.2.2
//! kind: Shipyard
//! metadata:
//!   name: shipyard-sockshop
//! spec:
//!   stages:
//!     - name: dev
//!       sequences:
//!         - name: delivery
//!           tasks:
//!             - name: deployment
//!             - name: test
//!     - name: staging
//!       sequences:
//!         - name: delivery
//!           triggeredOn:
//!             - event: dev.delivery.finished
//!               selector:
//!                 match:
//!                   result: pass
//!           tasks:
//!             - name: deployment
//! ```
//!
//! The controller fetches the raw text through a [`ShipyardSource`] when a
//! sequence is triggered and keeps a snapshot of the selected [`Sequence`] in
//! the sequence execution, so later edits never affect a running sequence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::ResultType;

/// Accepted `apiVersion` prefix.
pub const API_VERSION_PREFIX: &str = "spec.keptn.sh/0.2";

/// Required `kind`.
pub const SHIPYARD_KIND: &str = "Shipyard";

/// Selector key compared against the finished sequence's result.
const RESULT_SELECTOR: &str = "result";

/// A parsed shipyard document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipyard {
    /// Schema version.
    pub api_version: String,
    /// Document kind.
    pub kind: String,
    /// Document metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Pipeline definition.
    pub spec: ShipyardSpec,
}

/// Shipyard metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Document name.
    #[serde(default)]
    pub name: String,
}

/// The stages of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipyardSpec {
    /// Ordered stages.
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// One environment of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name.
    pub name: String,
    /// Sequences runnable in this stage.
    #[serde(default)]
    pub sequences: Vec<Sequence>,
}

/// A named, ordered list of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    /// Sequence name.
    pub name: String,
    /// Events of other sequences that start this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_on: Vec<TriggeredOn>,
    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Sequence {
    /// Returns the task at `index`.
    #[must_use]
    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }
}

/// One step of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task name; also the event type segment.
    pub name: String,
    /// Free-form properties forwarded to the executor.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

/// Rule starting a sequence when another sequence finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredOn {
    /// `<stage>.<sequence>.finished`
    pub event: String,
    /// Optional filter on the finished sequence's outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

/// Filter of a [`TriggeredOn`] rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    /// Expected values, e.g. `result: pass`.
    #[serde(rename = "match", default)]
    pub match_: BTreeMap<String, String>,
}

impl TriggeredOn {
    /// Returns true when this rule fires for `<stage>.<sequence>.finished`
    /// with `result`.
    ///
    /// Only events of exactly three segments are considered.
    #[must_use]
    pub fn matches(&self, stage: &str, sequence: &str, result: ResultType) -> bool {
        let segments: Vec<&str> = self.event.split('.').collect();
        let [rule_stage, rule_sequence, "finished"] = segments.as_slice() else {
            return false;
        };
        if *rule_stage != stage || *rule_sequence != sequence {
            return false;
        }
        match self
            .selector
            .as_ref()
            .and_then(|s| s.match_.get(RESULT_SELECTOR))
        {
            Some(expected) => expected == result.as_str(),
            None => true,
        }
    }
}

impl Shipyard {
    /// Parses and validates a shipyard document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidShipyard`] for malformed YAML, an unsupported
    /// `apiVersion` or `kind`, or duplicate or malformed names.
    pub fn parse(yaml: &str) -> Result<Self> {
        let shipyard: Self = serde_yaml::from_str(yaml).map_err(|e| Error::InvalidShipyard {
            message: e.to_string(),
        })?;
        shipyard.validate()?;
        Ok(shipyard)
    }

    fn validate(&self) -> Result<()> {
        if !self.api_version.starts_with(API_VERSION_PREFIX) {
            return Err(invalid(format!(
                "unsupported apiVersion '{}' (expected {API_VERSION_PREFIX}.x)",
                self.api_version
            )));
        }
        if self.kind != SHIPYARD_KIND {
            return Err(invalid(format!(
                "unsupported kind '{}' (expected {SHIPYARD_KIND})",
                self.kind
            )));
        }

        let mut stages = HashSet::new();
        for stage in &self.spec.stages {
            check_name("stage", &stage.name)?;
            if !stages.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.name)));
            }
            let mut sequences = HashSet::new();
            for sequence in &stage.sequences {
                check_name("sequence", &sequence.name)?;
                if !sequences.insert(sequence.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate sequence '{}' in stage '{}'",
                        sequence.name, stage.name
                    )));
                }
                for task in &sequence.tasks {
                    check_name("task", &task.name)?;
                }
            }
        }
        Ok(())
    }

    /// Stage names in declaration order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.spec.stages.iter().map(|s| s.name.as_str())
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.spec.stages.iter().find(|s| s.name == name)
    }

    /// Looks up a sequence of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the stage or sequence is missing.
    pub fn sequence(&self, stage: &str, sequence: &str) -> Result<&Sequence> {
        let found = self
            .stage(stage)
            .ok_or_else(|| Error::not_found("stage", stage))?;
        found
            .sequences
            .iter()
            .find(|s| s.name == sequence)
            .ok_or_else(|| Error::not_found("sequence", format!("{stage}.{sequence}")))
    }

    /// Sequences of other stages that start when `<stage>.<sequence>`
    /// finishes with `result`.
    ///
    /// Rules on sequences of `stage` itself are not considered.
    #[must_use]
    pub fn sequences_triggered_by(
        &self,
        stage: &str,
        sequence: &str,
        result: ResultType,
    ) -> Vec<(&Stage, &Sequence)> {
        let mut out = Vec::new();
        for candidate_stage in self.spec.stages.iter().filter(|s| s.name != stage) {
            for candidate in &candidate_stage.sequences {
                if candidate
                    .triggered_on
                    .iter()
                    .any(|rule| rule.matches(stage, sequence, result))
                {
                    out.push((candidate_stage, candidate));
                }
            }
        }
        out
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid(format!("{what} name must not be empty")));
    }
    if name.contains('.') {
        return Err(invalid(format!("{what} name '{name}' must not contain '.'")));
    }
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::InvalidShipyard { message }
}

/// Supplies the shipyard text of a project.
#[async_trait]
pub trait ShipyardSource: Send + Sync + fmt::Debug {
    /// Returns the raw shipyard YAML of `project`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the project has no shipyard.
    async fn fetch_shipyard(&self, project: &str) -> Result<String>;
}

/// Shipyard source backed by a map, for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryShipyardSource {
    documents: RwLock<HashMap<String, String>>,
}

impl InMemoryShipyardSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the shipyard of `project`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn put(&self, project: impl Into<String>, yaml: impl Into<String>) -> Result<()> {
        self.documents
            .write()
            .map_err(|_| Error::storage("shipyard source lock poisoned"))?
            .insert(project.into(), yaml.into());
        Ok(())
    }

    /// Forgets the shipyard of `project`.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn remove(&self, project: &str) -> Result<()> {
        self.documents
            .write()
            .map_err(|_| Error::storage("shipyard source lock poisoned"))?
            .remove(project);
        Ok(())
    }
}

#[async_trait]
impl ShipyardSource for InMemoryShipyardSource {
    async fn fetch_shipyard(&self, project: &str) -> Result<String> {
        self.documents
            .read()
            .map_err(|_| Error::storage("shipyard source lock poisoned"))?
            .get(project)
            .cloned()
            .ok_or_else(|| Error::not_found("shipyard", project))
    }
}

/// Shipyard source reading `<root>/<project>/shipyard.yaml`.
#[derive(Debug, Clone)]
pub struct FileShipyardSource {
    root: PathBuf,
}

impl FileShipyardSource {
    /// File name looked up inside each project directory.
    pub const FILE_NAME: &'static str = "shipyard.yaml";

    /// Creates a source rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the shipyard file of `project`.
    #[must_use]
    pub fn path_for(&self, project: &str) -> PathBuf {
        self.root.join(project).join(Self::FILE_NAME)
    }
}

#[async_trait]
impl ShipyardSource for FileShipyardSource {
    async fn fetch_shipyard(&self, project: &str) -> Result<String> {
        if project.is_empty() || project.contains(['/', '\\']) || project.starts_with('.') {
            return Err(Error::invalid_scope(format!(
                "project name '{project}' is not a valid directory name"
            )));
        }
        let path = self.path_for(project);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("shipyard", project))
            }
            Err(e) => Err(Error::storage_with_source(
                format!("failed to read {}", path.display()),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIPYARD: &str = r"
apiVersion: spec.keptn.sh/0.2.2
kind: Shipyard
metadata:
  name: shipyard-sockshop
spec:
  stages:
    - name: dev
      sequences:
        - name: delivery
          tasks:
            - name: deployment
              properties:
                deploymentstrategy: direct
            - name: test
    - name: staging
      sequences:
        - name: delivery
          triggeredOn:
            - event: dev.delivery.finished
              selector:
                match:
                  result: pass
          tasks:
            - name: deployment
        - name: rollback
          triggeredOn:
            - event: staging.delivery.finished
              selector:
                match:
                  result: fail
          tasks:
            - name: rollback
        - name: audit
          triggeredOn:
            - event: dev.delivery.finished
          tasks: []
        - name: nested
          triggeredOn:
            - event: team.dev.delivery.finished
          tasks: []
";

    #[test]
    fn parses_stages_and_tasks() {
        let shipyard = Shipyard::parse(SHIPYARD).unwrap();
        assert_eq!(shipyard.stage_names().collect::<Vec<_>>(), ["dev", "staging"]);

        let delivery = shipyard.sequence("dev", "delivery").unwrap();
        assert_eq!(delivery.tasks.len(), 2);
        assert_eq!(delivery.tasks[0].properties["deploymentstrategy"], "direct");
        assert!(delivery.tasks[1].properties.is_null());
    }

    #[test]
    fn missing_sequence_is_not_found() {
        let shipyard = Shipyard::parse(SHIPYARD).unwrap();
        assert!(shipyard.sequence("prod", "delivery").unwrap_err().is_not_found());
        assert!(shipyard.sequence("dev", "hotfix").unwrap_err().is_not_found());
    }

    #[test]
    fn rejects_unsupported_version_and_kind() {
        let v1 = SHIPYARD.replace("spec.keptn.sh/0.2.2", "spec.keptn.sh/0.1.7");
        assert!(matches!(Shipyard::parse(&v1), Err(Error::InvalidShipyard { .. })));

        let kind = SHIPYARD.replace("kind: Shipyard", "kind: Pipeline");
        assert!(matches!(Shipyard::parse(&kind), Err(Error::InvalidShipyard { .. })));
    }

    #[test]
    fn rejects_duplicate_stage_names() {
        let yaml = r"
apiVersion: spec.keptn.sh/0.2.0
kind: Shipyard
spec:
  stages:
    - name: dev
    - name: dev
";
        assert!(matches!(Shipyard::parse(yaml), Err(Error::InvalidShipyard { .. })));
    }

    #[test]
    fn pass_result_triggers_filtered_and_unfiltered_rules() {
        let shipyard = Shipyard::parse(SHIPYARD).unwrap();
        let names: Vec<_> = shipyard
            .sequences_triggered_by("dev", "delivery", ResultType::Pass)
            .into_iter()
            .map(|(stage, seq)| format!("{}.{}", stage.name, seq.name))
            .collect();
        assert_eq!(names, ["staging.delivery", "staging.audit"]);
    }

    #[test]
    fn fail_result_skips_pass_selector() {
        let shipyard = Shipyard::parse(SHIPYARD).unwrap();
        let names: Vec<_> = shipyard
            .sequences_triggered_by("dev", "delivery", ResultType::Fail)
            .into_iter()
            .map(|(stage, seq)| format!("{}.{}", stage.name, seq.name))
            .collect();
        assert_eq!(names, ["staging.audit"]);
    }

    #[test]
    fn same_stage_rules_do_not_fan_out() {
        let shipyard = Shipyard::parse(SHIPYARD).unwrap();
        let rollback = &shipyard.sequence("staging", "rollback").unwrap().triggered_on[0];
        assert!(rollback.matches("staging", "delivery", ResultType::Fail));
        assert!(
            shipyard
                .sequences_triggered_by("staging", "delivery", ResultType::Fail)
                .is_empty()
        );
    }

    #[test]
    fn result_selector_is_compared_exactly() {
        let rule = |expected: &str| TriggeredOn {
            event: "dev.delivery.finished".into(),
            selector: Some(Selector {
                match_: BTreeMap::from([("result".to_string(), expected.to_string())]),
            }),
        };
        assert!(rule("pass").matches("dev", "delivery", ResultType::Pass));
        assert!(!rule("Pass").matches("dev", "delivery", ResultType::Pass));
        assert!(!rule(" pass").matches("dev", "delivery", ResultType::Pass));
        assert!(!rule("pass").matches("dev", "delivery", ResultType::Warning));
    }

    #[test]
    fn rules_with_other_segment_counts_never_match() {
        let rule = TriggeredOn {
            event: "team.dev.delivery.finished".into(),
            selector: None,
        };
        assert!(!rule.matches("dev", "delivery", ResultType::Pass));
        assert!(!rule.matches("team", "dev", ResultType::Pass));
    }

    #[tokio::test]
    async fn in_memory_source_returns_stored_text() {
        let source = InMemoryShipyardSource::new();
        source.put("sockshop", SHIPYARD).unwrap();
        assert_eq!(source.fetch_shipyard("sockshop").await.unwrap(), SHIPYARD);
        assert!(source.fetch_shipyard("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn file_source_reports_missing_project() {
        let dir = std::env::temp_dir().join(format!("shipyard-src-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(dir.join("sockshop")).await.unwrap();
        tokio::fs::write(dir.join("sockshop").join("shipyard.yaml"), SHIPYARD)
            .await
            .unwrap();

        let source = FileShipyardSource::new(&dir);
        assert!(source.fetch_shipyard("sockshop").await.is_ok());
        assert!(source.fetch_shipyard("missing").await.unwrap_err().is_not_found());
        assert!(source.fetch_shipyard("../etc").await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
