//! An in-memory `Store` used by this crate's own tests, so gallery/matcher/
//! writer logic can be exercised without a live Postgres instance.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{IdentitySummary, MatchLogEntry, NewTemplateRow, Store, StoreError, TemplateRow};

#[derive(Default)]
pub struct InMemoryStore {
    identities: Mutex<Vec<IdentitySummary>>,
    templates: Mutex<Vec<TemplateRow>>,
    match_log: Mutex<Vec<MatchLogEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn match_log_len(&self) -> usize {
        self.match_log.lock().unwrap().len()
    }

    pub fn template_count(&self) -> usize {
        self.templates.lock().unwrap().len()
    }
}

fn row_from_new(row: NewTemplateRow, identity_name: String) -> TemplateRow {
    TemplateRow {
        template_id: row.template_id,
        identity_id: row.identity_id,
        identity_name,
        eye_side: row.eye_side,
        iris_codes: row.iris_codes,
        mask_codes: row.mask_codes,
        width: row.width,
        height: row.height,
        n_scales: row.n_scales,
        quality_score: row.quality_score,
        device_id: row.device_id,
        enrolled_at: Utc::now(),
        iris_popcount: row.iris_popcount,
        mask_popcount: row.mask_popcount,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ensure_identity(&self, identity_id: Uuid, name: &str) -> Result<(), StoreError> {
        let mut identities = self.identities.lock().unwrap();
        if let Some(existing) = identities.iter_mut().find(|i| i.identity_id == identity_id) {
            existing.name = name.to_owned();
        } else {
            identities.push(IdentitySummary {
                identity_id,
                name: name.to_owned(),
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn delete_identity(&self, identity_id: Uuid) -> Result<bool, StoreError> {
        let mut identities = self.identities.lock().unwrap();
        let before = identities.len();
        identities.retain(|i| i.identity_id != identity_id);
        self.templates.lock().unwrap().retain(|t| t.identity_id != identity_id);
        Ok(identities.len() < before)
    }

    async fn persist_template(&self, row: NewTemplateRow) -> Result<(), StoreError> {
        let name = self
            .identities
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.identity_id == row.identity_id)
            .map(|i| i.name.clone())
            .unwrap_or_default();
        self.templates.lock().unwrap().push(row_from_new(row, name));
        Ok(())
    }

    async fn load_all_templates(&self) -> Result<Vec<TemplateRow>, StoreError> {
        Ok(self.templates.lock().unwrap().clone())
    }

    async fn load_template(&self, template_id: Uuid) -> Result<Option<TemplateRow>, StoreError> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.template_id == template_id)
            .cloned())
    }

    async fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        Ok(self.identities.lock().unwrap().clone())
    }

    async fn insert_match_log_batch(&self, entries: &[MatchLogEntry]) -> Result<(), StoreError> {
        self.match_log.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    async fn upsert_identities_batch(&self, identities: &[(Uuid, String)]) -> Result<(), StoreError> {
        for (id, name) in identities {
            self.ensure_identity(*id, name).await?;
        }
        Ok(())
    }

    async fn insert_templates_batch(&self, rows: &[NewTemplateRow]) -> Result<(), StoreError> {
        for row in rows {
            self.persist_template(row.clone()).await?;
        }
        Ok(())
    }
}
