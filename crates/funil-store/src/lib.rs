//! Persistence boundary for opportunity rows: Postgres and in-memory adapters.

use std::collections::BTreeMap;

use async_trait::async_trait;
use funil_core::{Opportunity, OpportunityStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "funil-store";

/// Page size used when streaming a whole account back out of the store.
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

/// Keyed row storage. Rows are identified by `(owner_id, fingerprint)` and a
/// second upsert of the same key replaces the stored values.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn upsert_batch(&self, batch: &[Opportunity]) -> Result<(), StoreError>;

    /// Returns one page of an account's rows ordered by `(created_at, fingerprint)`.
    async fn fetch_page(
        &self,
        owner_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Opportunity>, StoreError>;

    /// Pages through the account until a short page signals the end.
    async fn fetch_all(
        &self,
        owner_id: Uuid,
        page_size: u64,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let page_size = page_size.max(1);
        let mut all = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = self.fetch_page(owner_id, offset, page_size).await?;
            let short = (page.len() as u64) < page_size;
            offset += page.len() as u64;
            all.extend(page);
            if short {
                break;
            }
        }
        Ok(all)
    }
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS opportunities (
    owner_id UUID NOT NULL,
    fingerprint TEXT NOT NULL,
    seller TEXT NOT NULL,
    funnel TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    amount DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    closed_at TIMESTAMPTZ,
    lead_source TEXT NOT NULL,
    customer_name TEXT NOT NULL,
    region_code TEXT NOT NULL,
    city TEXT NOT NULL,
    product TEXT NOT NULL,
    loss_reason TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (owner_id, fingerprint)
)";

const UPSERT_SQL: &str = "
INSERT INTO opportunities (
    owner_id, fingerprint, seller, funnel, stage, status, amount,
    created_at, closed_at, lead_source, customer_name, region_code,
    city, product, loss_reason, updated_at
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
ON CONFLICT (owner_id, fingerprint) DO UPDATE SET
    seller = EXCLUDED.seller,
    funnel = EXCLUDED.funnel,
    stage = EXCLUDED.stage,
    status = EXCLUDED.status,
    amount = EXCLUDED.amount,
    created_at = EXCLUDED.created_at,
    closed_at = EXCLUDED.closed_at,
    lead_source = EXCLUDED.lead_source,
    customer_name = EXCLUDED.customer_name,
    region_code = EXCLUDED.region_code,
    city = EXCLUDED.city,
    product = EXCLUDED.product,
    loss_reason = EXCLUDED.loss_reason,
    updated_at = NOW()";

const PAGE_SQL: &str = "
SELECT owner_id, fingerprint, seller, funnel, stage, status, amount,
       created_at, closed_at, lead_source, customer_name, region_code,
       city, product, loss_reason
FROM opportunities
WHERE owner_id = $1
ORDER BY created_at ASC, fingerprint ASC
OFFSET $2 LIMIT $3";

/// Postgres-backed store.
pub struct PgRowStore {
    pool: PgPool,
}

impl PgRowStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_opportunity(row: &PgRow) -> Result<Opportunity, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = OpportunityStatus::parse_wire(&status_raw)
        .ok_or_else(|| StoreError::Decode(format!("unexpected status {status_raw:?}")))?;
    Ok(Opportunity {
        owner_id: row.try_get("owner_id")?,
        fingerprint: row.try_get("fingerprint")?,
        seller: row.try_get("seller")?,
        funnel: row.try_get("funnel")?,
        stage: row.try_get("stage")?,
        status,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
        closed_at: row.try_get("closed_at")?,
        lead_source: row.try_get("lead_source")?,
        customer_name: row.try_get("customer_name")?,
        region_code: row.try_get("region_code")?,
        city: row.try_get("city")?,
        product: row.try_get("product")?,
        loss_reason: row.try_get("loss_reason")?,
    })
}

#[async_trait]
impl RowStore for PgRowStore {
    async fn upsert_batch(&self, batch: &[Opportunity]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for opp in batch {
            sqlx::query(UPSERT_SQL)
                .bind(opp.owner_id)
                .bind(&opp.fingerprint)
                .bind(&opp.seller)
                .bind(&opp.funnel)
                .bind(&opp.stage)
                .bind(opp.status.as_str())
                .bind(opp.amount)
                .bind(opp.created_at)
                .bind(opp.closed_at)
                .bind(&opp.lead_source)
                .bind(&opp.customer_name)
                .bind(&opp.region_code)
                .bind(&opp.city)
                .bind(&opp.product)
                .bind(&opp.loss_reason)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(rows = batch.len(), "upserted opportunity batch");
        Ok(())
    }

    async fn fetch_page(
        &self,
        owner_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(PAGE_SQL)
            .bind(owner_id)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_opportunity).collect()
    }
}

/// Process-local store used by tests and keyless local runs.
#[derive(Default)]
pub struct MemoryRowStore {
    rows: RwLock<BTreeMap<(Uuid, String), Opportunity>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn upsert_batch(&self, batch: &[Opportunity]) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        for opp in batch {
            rows.insert((opp.owner_id, opp.fingerprint.clone()), opp.clone());
        }
        Ok(())
    }

    async fn fetch_page(
        &self,
        owner_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let rows = self.rows.read().await;
        let mut owned: Vec<Opportunity> = rows
            .values()
            .filter(|opp| opp.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(owned
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use funil_core::OpportunityStatus;

    fn mk_row(owner: Uuid, fingerprint: &str, day: u32, amount: f64) -> Opportunity {
        Opportunity {
            owner_id: owner,
            fingerprint: fingerprint.to_string(),
            seller: "Ana".to_string(),
            funnel: "Inbound".to_string(),
            stage: "General".to_string(),
            status: OpportunityStatus::Open,
            amount,
            created_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            closed_at: None,
            lead_source: "Site".to_string(),
            customer_name: "Acme".to_string(),
            region_code: "SP".to_string(),
            city: "Campinas".to_string(),
            product: "Plano Pro".to_string(),
            loss_reason: "Not informed".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_upsert_replaces_same_key() {
        let store = MemoryRowStore::new();
        let owner = Uuid::new_v4();
        store.upsert_batch(&[mk_row(owner, "fp-1", 1, 100.0)]).await.unwrap();
        store.upsert_batch(&[mk_row(owner, "fp-1", 1, 250.0)]).await.unwrap();

        let rows = store.fetch_all(owner, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 250.0);
    }

    #[tokio::test]
    async fn memory_pages_are_ordered_and_scoped_to_owner() {
        let store = MemoryRowStore::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        store
            .upsert_batch(&[
                mk_row(owner, "fp-b", 2, 10.0),
                mk_row(owner, "fp-a", 2, 20.0),
                mk_row(owner, "fp-c", 1, 30.0),
                mk_row(other, "fp-x", 1, 40.0),
            ])
            .await
            .unwrap();

        let rows = store.fetch_all(owner, DEFAULT_PAGE_SIZE).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(keys, vec!["fp-c", "fp-a", "fp-b"]);
    }

    #[tokio::test]
    async fn fetch_all_walks_short_pages() {
        let store = MemoryRowStore::new();
        let owner = Uuid::new_v4();
        let batch: Vec<Opportunity> = (0..5)
            .map(|i| mk_row(owner, &format!("fp-{i}"), 1 + i as u32, 10.0))
            .collect();
        store.upsert_batch(&batch).await.unwrap();

        let rows = store.fetch_all(owner, 2).await.unwrap();
        assert_eq!(rows.len(), 5);
    }
}
