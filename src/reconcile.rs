//! Net-value recomputation and subtotal reconciliation for the review table.
//!
//! Totals are always re-derived from quantity, unit price and discount; nothing
//! cached on a line is trusted. A mismatch against the document subtotal is an
//! advisory flag for the reviewer and never blocks a commit.

use serde::{Deserialize, Serialize};

use crate::error::EditError;
use crate::schema::{WorkItem, RECONCILIATION_TOLERANCE};

/// Outcome of reconciling a set of lines against the document subtotal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub work_items: Vec<WorkItem>,
    pub grand_total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
    /// `grandTotal − subtotal`, when a subtotal is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difference: Option<f64>,
    pub mismatched: bool,
}

/// One reviewer change to the table. Indexes refer to the table as it stands
/// after the preceding edits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TableEdit {
    SetQuantity { index: usize, value: f64 },
    SetUnitPrice { index: usize, value: f64 },
    SetDiscount { index: usize, value: f64 },
    AddItem { item: WorkItem },
    RemoveItem { index: usize },
}

/// Request body for server-side reconciliation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileRequest {
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default)]
    pub edits: Vec<TableEdit>,
}

impl ReconcileRequest {
    /// Replay the edits in order and summarize the resulting table.
    pub fn resolve(self) -> Result<ReconciliationSummary, EditError> {
        let mut table = ReviewTable::new(self.work_items, self.subtotal);
        for edit in self.edits {
            table.apply(edit)?;
        }
        Ok(table.summary())
    }
}

pub fn is_mismatched(grand_total: f64, subtotal: Option<f64>) -> bool {
    subtotal
        .map(|s| (grand_total - s).abs() > RECONCILIATION_TOLERANCE)
        .unwrap_or(false)
}

/// Recompute every line and the grand total, then compare with the subtotal.
pub fn reconcile(items: &[WorkItem], subtotal: Option<f64>) -> ReconciliationSummary {
    let work_items: Vec<WorkItem> = items
        .iter()
        .cloned()
        .map(|mut item| {
            item.recalculate();
            item
        })
        .collect();

    let grand_total: f64 = work_items.iter().map(|i| i.total).sum();

    ReconciliationSummary {
        grand_total,
        subtotal,
        difference: subtotal.map(|s| grand_total - s),
        mismatched: is_mismatched(grand_total, subtotal),
        work_items,
    }
}

/// Editable table of extracted lines under human review.
#[derive(Debug, Clone)]
pub struct ReviewTable {
    items: Vec<WorkItem>,
    subtotal: Option<f64>,
}

impl ReviewTable {
    pub fn new(items: Vec<WorkItem>, subtotal: Option<f64>) -> Self {
        let mut table = Self { items, subtotal };
        table.items.iter_mut().for_each(WorkItem::recalculate);
        table
    }

    pub fn apply(&mut self, edit: TableEdit) -> Result<(), EditError> {
        match edit {
            TableEdit::SetQuantity { index, value } => self.set_quantity(index, value).map(drop),
            TableEdit::SetUnitPrice { index, value } => self.set_unit_price(index, value).map(drop),
            TableEdit::SetDiscount { index, value } => self.set_discount(index, value).map(drop),
            TableEdit::AddItem { item } => {
                self.add_item(item);
                Ok(())
            }
            TableEdit::RemoveItem { index } => self.remove_item(index).map(drop),
        }
    }

    pub fn set_quantity(&mut self, index: usize, quantity: f64) -> Result<&WorkItem, EditError> {
        self.edit(index, |item| item.quantity = quantity)
    }

    pub fn set_unit_price(&mut self, index: usize, unit_price: f64) -> Result<&WorkItem, EditError> {
        self.edit(index, |item| item.unit_price = unit_price)
    }

    pub fn set_discount(&mut self, index: usize, discount: f64) -> Result<&WorkItem, EditError> {
        self.edit(index, |item| item.discount = discount)
    }

    pub fn add_item(&mut self, mut item: WorkItem) {
        item.recalculate();
        self.items.push(item);
    }

    pub fn remove_item(&mut self, index: usize) -> Result<WorkItem, EditError> {
        self.check_index(index)?;
        Ok(self.items.remove(index))
    }

    pub fn summary(&self) -> ReconciliationSummary {
        reconcile(&self.items, self.subtotal)
    }

    fn edit(
        &mut self,
        index: usize,
        apply: impl FnOnce(&mut WorkItem),
    ) -> Result<&WorkItem, EditError> {
        self.check_index(index)?;
        let item = &mut self.items[index];
        apply(item);
        item.recalculate();
        Ok(item)
    }

    fn check_index(&self, index: usize) -> Result<(), EditError> {
        if index < self.items.len() {
            Ok(())
        } else {
            Err(EditError::NoSuchLine {
                index,
                len: self.items.len(),
            })
        }
    }
}
