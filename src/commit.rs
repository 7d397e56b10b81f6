//! Commit pipeline: approved work items become a project and a contract.
//!
//! Both records are written in one atomic transaction. Any failure is converted
//! into a single user-facing error string and nothing partial is persisted.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{CommitError, StoreError};
use crate::records::{
    CommitOutcome, Contract, ContractStatus, DocDetails, Project, ProjectStatus, Task, TaskStatus,
    VersionEntry, INITIAL_VERSION_SUMMARY,
};
use crate::schema::{now_iso8601, WorkItem};

pub const PROJECTS: &str = "projects";
pub const CONTRACTS: &str = "contracts";

/// Contract length applied when no end date is supplied.
const DEFAULT_CONTRACT_DAYS: u64 = 30;

/// One record to be written inside a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordWrite {
    pub collection: String,
    pub id: String,
    pub record: serde_json::Value,
}

/// Database collaborator with an all-or-nothing multi-record write.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn transaction(&self, writes: Vec<RecordWrite>) -> Result<(), StoreError>;
}

/// Request body for the commit entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub doc_details: DocDetails,
    pub work_items: Vec<WorkItem>,
}

/// The pair of records produced from one approved document.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub project: Project,
    pub contract: Contract,
}

impl CommitPlan {
    /// Project first, then the contract that references it.
    pub fn writes(&self) -> Result<Vec<RecordWrite>, CommitError> {
        Ok(vec![
            RecordWrite {
                collection: PROJECTS.to_string(),
                id: self.project.id.clone(),
                record: serde_json::to_value(&self.project)?,
            },
            RecordWrite {
                collection: CONTRACTS.to_string(),
                id: self.contract.id.clone(),
                record: serde_json::to_value(&self.contract)?,
            },
        ])
    }
}

pub struct CommitPipeline {
    store: Arc<dyn Persistence>,
}

impl CommitPipeline {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Commit approved items. Never fails: errors come back as [`CommitOutcome::Failed`].
    pub async fn commit(&self, details: DocDetails, items: Vec<WorkItem>) -> CommitOutcome {
        match self.try_commit(&details, items).await {
            Ok(plan) => {
                info!(
                    "Committed project {} and contract {} for {} ({} tasks, total {:.2})",
                    plan.project.id,
                    plan.contract.id,
                    details.name,
                    plan.project.tasks.len(),
                    plan.contract.total_value
                );
                CommitOutcome::Created {
                    project_id: plan.project.id,
                    contract_id: plan.contract.id,
                }
            }
            Err(e) => {
                error!("Commit failed for {}: {}", details.name, e);
                CommitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn try_commit(
        &self,
        details: &DocDetails,
        items: Vec<WorkItem>,
    ) -> Result<CommitPlan, CommitError> {
        let plan = plan_commit(details, items, Utc::now().date_naive())?;
        self.store.transaction(plan.writes()?).await?;
        Ok(plan)
    }
}

/// Validate the request and compose both records.
pub fn plan_commit(
    details: &DocDetails,
    items: Vec<WorkItem>,
    today: NaiveDate,
) -> Result<CommitPlan, CommitError> {
    validate(details, &items)?;

    let items: Vec<WorkItem> = items
        .into_iter()
        .map(|mut item| {
            item.recalculate();
            item
        })
        .collect();

    let start_date = details.start_date.unwrap_or(today);
    let end_date = match details.end_date {
        Some(end) => end,
        None => start_date
            .checked_add_days(Days::new(DEFAULT_CONTRACT_DAYS))
            .ok_or_else(|| CommitError::Validation("start date out of range".to_string()))?,
    };
    if end_date < start_date {
        return Err(CommitError::Validation(format!(
            "end date {} is before start date {}",
            end_date, start_date
        )));
    }

    let total = total_value(&items);
    let created_at = now_iso8601();
    let custom_id = details
        .custom_id
        .as_ref()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: details.name.trim().to_string(),
        client: details.client.trim().to_string(),
        custom_id: custom_id.clone(),
        status: ProjectStatus::Planning,
        start_date,
        end_date,
        total_value: total,
        tasks: build_tasks(&items),
        created_at: created_at.clone(),
    };

    let contract = Contract {
        id: Uuid::new_v4().to_string(),
        project_id: project.id.clone(),
        custom_id,
        name: project.name.clone(),
        client: project.client.clone(),
        status: ContractStatus::Active,
        start_date,
        end_date,
        total_value: total,
        scope: scope_narrative(&items),
        version_history: vec![VersionEntry {
            version: 1,
            date: created_at.clone(),
            change_summary: INITIAL_VERSION_SUMMARY.to_string(),
            items,
        }],
        created_at,
    };

    Ok(CommitPlan { project, contract })
}

fn validate(details: &DocDetails, items: &[WorkItem]) -> Result<(), CommitError> {
    if details.name.trim().is_empty() {
        return Err(CommitError::Validation("document name is required".to_string()));
    }
    if details.client.trim().is_empty() {
        return Err(CommitError::Validation("client is required".to_string()));
    }
    if items.is_empty() {
        return Err(CommitError::Validation("at least one work item is required".to_string()));
    }
    for (index, item) in items.iter().enumerate() {
        if item.name.trim().is_empty() {
            return Err(CommitError::Validation(format!("work item {} has no name", index + 1)));
        }
        if ![item.quantity, item.unit_price, item.discount]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(CommitError::Validation(format!(
                "work item {} has a non-numeric amount",
                index + 1
            )));
        }
    }
    Ok(())
}

/// Σ (quantity × unitPrice − discount).
pub fn total_value(items: &[WorkItem]) -> f64 {
    items.iter().map(WorkItem::net_value).sum()
}

pub fn build_tasks(items: &[WorkItem]) -> Vec<Task> {
    items
        .iter()
        .map(|item| Task {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            discount: item.discount,
            value: item.net_value(),
            status: TaskStatus::NotStarted,
        })
        .collect()
}

/// Human-readable scope enumerating every line plus a grand total.
pub fn scope_narrative(items: &[WorkItem]) -> String {
    let mut scope = String::from("Scope of work:\n");
    for item in items {
        let _ = writeln!(
            scope,
            "[{}] {}: quantity {}, unit price {:.2}, discount {:.2}, subtotal {:.2}",
            item.id,
            item.name,
            format_quantity(item.quantity),
            item.unit_price,
            item.discount,
            item.net_value()
        );
    }
    let _ = write!(scope, "Total: {:.2}", total_value(items));
    scope
}

fn format_quantity(quantity: f64) -> String {
    if quantity.fract() == 0.0 {
        format!("{:.0}", quantity)
    } else {
        format!("{}", quantity)
    }
}
