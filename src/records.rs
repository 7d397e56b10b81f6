//! Persisted commit targets: projects and contracts.
//!
//! Separate from `schema.rs` since these are the records written to the database,
//! while `schema.rs` is the contract with the model.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::schema::WorkItem;

/// Change summary recorded on the first version of every committed contract.
pub const INITIAL_VERSION_SUMMARY: &str = "initial version extracted from document";

/// Document metadata supplied alongside the approved work items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocDetails {
    pub name: String,
    pub client: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
}

/// Project task derived from one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Item number from the source document.
    pub item_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount: f64,
    pub value: f64,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub client: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub status: ProjectStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_value: f64,
    pub tasks: Vec<Task>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
}

/// Immutable snapshot of the committed line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: u32,
    pub date: String,
    pub change_summary: String,
    pub items: Vec<WorkItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    pub name: String,
    pub client: String,
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_value: f64,
    pub scope: String,
    pub version_history: Vec<VersionEntry>,
    pub created_at: String,
}

/// Result object returned by the commit pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommitOutcome {
    #[serde(rename_all = "camelCase")]
    Created {
        project_id: String,
        contract_id: String,
    },
    Failed { error: String },
}

impl CommitOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_outcome_wire_shape() {
        let created = CommitOutcome::Created {
            project_id: "p1".into(),
            contract_id: "c1".into(),
        };
        let json = serde_json::to_value(&created).unwrap();
        assert_eq!(json, serde_json::json!({"projectId": "p1", "contractId": "c1"}));

        let failed = CommitOutcome::Failed {
            error: "boom".into(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json, serde_json::json!({"error": "boom"}));
    }

    #[test]
    fn test_doc_details_optional_fields() {
        let details: DocDetails =
            serde_json::from_str(r#"{"name":"Tower B","client":"Acme","startDate":"2026-01-15"}"#)
                .unwrap();
        assert_eq!(details.start_date, NaiveDate::from_ymd_opt(2026, 1, 15));
        assert!(details.end_date.is_none());
        assert!(details.custom_id.is_none());
    }
}
