use async_trait::async_trait;
use std::sync::Arc;

use crate::{CallerId, GridError, RecordStore, TableId};

/// Decides whether a caller may read or mutate a table.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn authorize(&self, caller: &CallerId, table_id: TableId) -> Result<(), GridError>;
}

/// Grants access to the table's owner only. Unknown tables are unauthorized,
/// so a caller cannot probe which ids exist.
pub struct OwnerAccess<S: RecordStore + ?Sized> {
    store: Arc<S>,
}

impl<S: RecordStore + ?Sized> OwnerAccess<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RecordStore + ?Sized> AccessControl for OwnerAccess<S> {
    async fn authorize(&self, caller: &CallerId, table_id: TableId) -> Result<(), GridError> {
        match self.store.table(table_id).await? {
            Some(table) if table.owner == *caller => Ok(()),
            _ => {
                log::warn!("[ACCESS] {caller} denied on table {table_id}");
                Err(GridError::Unauthorized(table_id))
            }
        }
    }
}

/// Single-user and test setups.
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn authorize(&self, _caller: &CallerId, _table_id: TableId) -> Result<(), GridError> {
        Ok(())
    }
}
