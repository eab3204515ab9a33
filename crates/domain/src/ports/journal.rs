use crate::DomainResult;
use crate::journal::JournalEntry;
use crate::ports::BoxFuture;

pub trait JournalRepository: Send + Sync {
    fn create(&self, entry: &JournalEntry) -> BoxFuture<'_, DomainResult<JournalEntry>>;

    fn get(&self, entry_id: &str) -> BoxFuture<'_, DomainResult<Option<JournalEntry>>>;

    fn list_by_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<JournalEntry>>>;
}
