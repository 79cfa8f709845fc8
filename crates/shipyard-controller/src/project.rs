//! The materialized project document.
//!
//! One [`ExpandedProject`] per project holds its stages, their services and
//! what last happened to each service. The document is folded incrementally
//! from the event stream by [`crate::view::ProjectMaterializedView`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last event of one type seen for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContextInfo {
    /// Event id.
    pub event_id: String,
    /// Run the event belongs to.
    pub keptn_context: String,
    /// When it was recorded.
    pub time: DateTime<Utc>,
}

/// An open remediation of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    /// Id of the event that opened it.
    pub event_id: String,
    /// Run that is remediating.
    pub keptn_context: String,
    /// Type of the opening event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When it was opened.
    pub time: DateTime<Utc>,
}

/// A service within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedService {
    /// Service name.
    pub service_name: String,
    /// When the service was added to the stage.
    pub creation_date: DateTime<Utc>,
    /// Artifact of the last finished deployment.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployed_image: String,
    /// Last event per event type. Keys are escaped in storage.
    #[serde(default, with = "shipyard_core::escape::escaped_keys")]
    pub last_event_types: BTreeMap<String, EventContextInfo>,
    /// Remediations that have not completed.
    #[serde(default)]
    pub open_remediations: Vec<Remediation>,
}

impl ExpandedService {
    /// Creates a service with no history.
    #[must_use]
    pub fn new(name: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            service_name: name.into(),
            creation_date: created,
            deployed_image: String::new(),
            last_event_types: BTreeMap::new(),
            open_remediations: Vec::new(),
        }
    }
}

/// A stage of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedStage {
    /// Stage name.
    pub stage_name: String,
    /// Services deployed to the stage.
    #[serde(default)]
    pub services: Vec<ExpandedService>,
}

impl ExpandedStage {
    /// Creates a stage without services.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stage_name: name.into(),
            services: Vec::new(),
        }
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ExpandedService> {
        self.services.iter().find(|s| s.service_name == name)
    }

    /// Looks up a service for modification.
    pub fn service_mut(&mut self, name: &str) -> Option<&mut ExpandedService> {
        self.services.iter_mut().find(|s| s.service_name == name)
    }
}

/// The materialized state of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedProject {
    /// Project name; also the document id.
    pub project_name: String,
    /// Raw shipyard text.
    #[serde(default)]
    pub shipyard: String,
    /// Upstream repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_remote_uri: String,
    /// Upstream user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_user: String,
    /// When the project was created.
    pub creation_date: DateTime<Utc>,
    /// When the document last changed.
    pub last_changed: DateTime<Utc>,
    /// Stages in shipyard order.
    #[serde(default)]
    pub stages: Vec<ExpandedStage>,
}

impl ExpandedProject {
    /// Creates a project without stages.
    #[must_use]
    pub fn new(name: impl Into<String>, shipyard: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            project_name: name.into(),
            shipyard: shipyard.into(),
            git_remote_uri: String::new(),
            git_user: String::new(),
            creation_date: created,
            last_changed: created,
            stages: Vec::new(),
        }
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&ExpandedStage> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Looks up a stage for modification.
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut ExpandedStage> {
        self.stages.iter_mut().find(|s| s.stage_name == name)
    }

    /// Looks up a service of a stage.
    #[must_use]
    pub fn service(&self, stage: &str, service: &str) -> Option<&ExpandedService> {
        self.stage(stage).and_then(|s| s.service(service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_keys_are_escaped_in_documents() {
        let now = Utc::now();
        let mut service = ExpandedService::new("carts", now);
        service.last_event_types.insert(
            "sh.keptn.event.deployment.finished".into(),
            EventContextInfo {
                event_id: "e1".into(),
                keptn_context: "ctx".into(),
                time: now,
            },
        );

        let doc = serde_json::to_value(&service).unwrap();
        let keys: Vec<&String> = doc["lastEventTypes"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["sh~pkeptn~pevent~pdeployment~pfinished"]);

        let back: ExpandedService = serde_json::from_value(doc).unwrap();
        assert_eq!(back, service);
    }

    #[test]
    fn lookups_by_name() {
        let now = Utc::now();
        let mut project = ExpandedProject::new("sockshop", "", now);
        project.stages.push(ExpandedStage::new("dev"));
        project
            .stage_mut("dev")
            .unwrap()
            .services
            .push(ExpandedService::new("carts", now));

        assert!(project.service("dev", "carts").is_some());
        assert!(project.service("dev", "orders").is_none());
        assert!(project.service("prod", "carts").is_none());
    }
}
