//! Canonical domain model for Funil: normalized CRM opportunity records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "funil-core";

/// One raw spreadsheet row: header text mapped to the cell text as exported.
pub type RawRecord = BTreeMap<String, String>;

pub const DEFAULT_SELLER: &str = "N/A";
pub const DEFAULT_FUNNEL: &str = "General";
pub const DEFAULT_STAGE: &str = "General";
pub const DEFAULT_LEAD_SOURCE: &str = "N/A";
pub const DEFAULT_CUSTOMER_NAME: &str = "Anonymous";
pub const DEFAULT_REGION_CODE: &str = "NA";
pub const DEFAULT_CITY: &str = "N/A";
pub const DEFAULT_PRODUCT: &str = "General";
pub const DEFAULT_LOSS_REASON: &str = "Not informed";

/// Outcome of an opportunity. Free-text vendor statuses collapse into these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Won,
    Lost,
    Open,
}

impl OpportunityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Open => "open",
        }
    }

    /// Parses the stable storage form (`won`, `lost`, `open`).
    pub fn parse_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "open" => Some(Self::Open),
            _ => None,
        }
    }
}

/// Fully normalized opportunity fields, before account identity is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    pub seller: String,
    pub funnel: String,
    pub stage: String,
    pub status: OpportunityStatus,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub lead_source: String,
    pub customer_name: String,
    pub region_code: String,
    pub city: String,
    pub product: String,
    pub loss_reason: String,
}

/// Canonical persisted record. `(owner_id, fingerprint)` is the upsert key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub owner_id: Uuid,
    pub fingerprint: String,
    pub seller: String,
    pub funnel: String,
    pub stage: String,
    pub status: OpportunityStatus,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub lead_source: String,
    pub customer_name: String,
    pub region_code: String,
    pub city: String,
    pub product: String,
    pub loss_reason: String,
}

impl Opportunity {
    pub fn from_draft(owner_id: Uuid, fingerprint: String, draft: OpportunityDraft) -> Self {
        Self {
            owner_id,
            fingerprint,
            seller: draft.seller,
            funnel: draft.funnel,
            stage: draft.stage,
            status: draft.status,
            amount: draft.amount,
            created_at: draft.created_at,
            closed_at: draft.closed_at,
            lead_source: draft.lead_source,
            customer_name: draft.customer_name,
            region_code: draft.region_code,
            city: draft.city,
            product: draft.product,
            loss_reason: draft.loss_reason,
        }
    }
}

/// A spreadsheet header no alias matched, with the closest known alias when one is near.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedHeader {
    pub header: String,
    pub hint: Option<String>,
}

/// Per-upload ingestion statistics returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub parsed_rows: usize,
    pub accepted: usize,
    pub duplicates_collapsed: usize,
    pub invalid_rows: usize,
    pub unmapped_headers: Vec<UnmappedHeader>,
    pub stored_total: usize,
}
