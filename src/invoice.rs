// src/invoice.rs

use serde::{Deserialize, Serialize};

/// A single invoice line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub item: String,
    pub qty: i64,
    pub cost: f64,
}

/// Fields the model extracts from a valid invoice (Schema A, minus `status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub vendor: String,
    pub date: String,
    pub line_items: Vec<LineItem>,
    pub total_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_language: Option<String>,
}

impl InvoiceRecord {
    /// One-line summary of the line items, e.g. `2x Widget; 1x Bolt`.
    pub fn items_summary(&self) -> String {
        self.line_items
            .iter()
            .map(|i| format!("{}x {}", i.qty, i.item))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Outcome of a model call that produced usable JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// Schema A.
    Success(InvoiceRecord),
    /// Schema B: the model decided the input is not something it can extract.
    Rejected { reason: String },
}
