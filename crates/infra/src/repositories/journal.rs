use std::collections::HashMap;
use std::sync::Arc;

use reverie_domain::DomainResult;
use reverie_domain::error::DomainError;
use reverie_domain::journal::JournalEntry;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::journal::JournalRepository;
use tokio::sync::RwLock;

/// Entries keyed by id, plus an insertion-ordered index per user.
#[derive(Default)]
pub struct InMemoryJournalRepository {
    entries: Arc<RwLock<HashMap<String, JournalEntry>>>,
    by_user: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl InMemoryJournalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalRepository for InMemoryJournalRepository {
    fn create(&self, entry: &JournalEntry) -> BoxFuture<'_, DomainResult<JournalEntry>> {
        let entry = entry.clone();
        let entries = self.entries.clone();
        let by_user = self.by_user.clone();
        Box::pin(async move {
            let mut items = entries.write().await;
            if items.contains_key(&entry.id) {
                return Err(DomainError::Internal(format!(
                    "journal entry {} already exists",
                    entry.id
                )));
            }
            items.insert(entry.id.clone(), entry.clone());
            by_user
                .write()
                .await
                .entry(entry.user_id.clone())
                .or_default()
                .push(entry.id.clone());
            Ok(entry)
        })
    }

    fn get(&self, entry_id: &str) -> BoxFuture<'_, DomainResult<Option<JournalEntry>>> {
        let entry_id = entry_id.to_string();
        let entries = self.entries.clone();
        Box::pin(async move { Ok(entries.read().await.get(&entry_id).cloned()) })
    }

    fn list_by_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<JournalEntry>>> {
        let user_id = user_id.to_string();
        let entries = self.entries.clone();
        let by_user = self.by_user.clone();
        Box::pin(async move {
            let ids = by_user.read().await.get(&user_id).cloned().unwrap_or_default();
            let items = entries.read().await;
            // newest first
            Ok(ids
                .iter()
                .rev()
                .filter_map(|id| items.get(id).cloned())
                .collect())
        })
    }
}
