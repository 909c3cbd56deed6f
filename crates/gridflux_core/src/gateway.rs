use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    AccessControl, CallerId, GridError, Mutation, MutationTicket, NewView, QueueManager,
    RecordStore, Table, TableId, TableSnapshot, View, ViewConfig, ViewId,
};

pub const DEFAULT_VIEW_NAME: &str = "Grid view";

/// Anything that accepts mutations for the queue on behalf of a client.
#[async_trait]
pub trait MutationSubmitter: Send + Sync {
    async fn submit(&self, mutation: Mutation) -> Result<MutationTicket, GridError>;
}

/// Trusted in-process submission: validated, never access-checked.
#[async_trait]
impl MutationSubmitter for QueueManager {
    async fn submit(&self, mutation: Mutation) -> Result<MutationTicket, GridError> {
        mutation.validate()?;
        Ok(self.enqueue(mutation))
    }
}

/// Entry point for callers: checks input and access before anything is queued,
/// and serves the reads a client needs to open a table.
pub struct MutationGateway {
    store: Arc<dyn RecordStore>,
    access: Arc<dyn AccessControl>,
    queue: QueueManager,
}

impl MutationGateway {
    pub fn new(
        store: Arc<dyn RecordStore>,
        access: Arc<dyn AccessControl>,
        queue: QueueManager,
    ) -> Self {
        Self {
            store,
            access,
            queue,
        }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Rejections (bad input, access) are returned here and never reach the queue.
    pub async fn submit(
        &self,
        caller: &CallerId,
        mutation: Mutation,
    ) -> Result<MutationTicket, GridError> {
        let checked = match mutation.validate() {
            Ok(()) => self.access.authorize(caller, mutation.table_id()).await,
            Err(error) => Err(error),
        };

        match checked {
            Ok(()) => Ok(self.queue.enqueue(mutation)),
            Err(error) if error.is_rejection() => {
                log::debug!(
                    "[GATEWAY] rejected {} from {caller}: {error}",
                    mutation.kind().label()
                );
                Err(error)
            }
            Err(error) => {
                log::warn!(
                    "[GATEWAY] could not check {} from {caller}: {error}",
                    mutation.kind().label()
                );
                Err(error)
            }
        }
    }

    /// Binds the gateway to one caller so it can be handed to a session.
    pub fn for_caller(self: &Arc<Self>, caller: CallerId) -> CallerGateway {
        CallerGateway {
            gateway: Arc::clone(self),
            caller,
        }
    }

    /// Creates a table owned by the caller, together with its default view.
    pub async fn create_table(&self, caller: &CallerId, name: &str) -> Result<Table, GridError> {
        if name.trim().is_empty() {
            return Err(GridError::invalid("table name must not be empty"));
        }

        let table = self.store.create_table(caller, name.trim()).await?;
        let view = NewView {
            name: DEFAULT_VIEW_NAME.to_string(),
            config: ViewConfig::default(),
            is_default: true,
        };
        self.store.create_view(table.id, &view).await?;

        log::info!("[GATEWAY] {caller} created table {} ({})", table.name, table.id);
        Ok(table)
    }

    pub async fn tables(&self, caller: &CallerId) -> Result<Vec<Table>, GridError> {
        self.store.tables_for_owner(caller).await
    }

    pub async fn snapshot(
        &self,
        caller: &CallerId,
        table_id: TableId,
    ) -> Result<TableSnapshot, GridError> {
        self.access.authorize(caller, table_id).await?;

        let table = self
            .store
            .table(table_id)
            .await?
            .ok_or_else(|| GridError::NotFound(format!("table {table_id}")))?;

        Ok(TableSnapshot {
            table,
            columns: self.store.columns(table_id).await?,
            rows: self.store.rows(table_id).await?,
            cells: self.store.cells(table_id).await?,
            views: self.store.views(table_id).await?,
        })
    }

    pub async fn views(
        &self,
        caller: &CallerId,
        table_id: TableId,
    ) -> Result<Vec<View>, GridError> {
        self.access.authorize(caller, table_id).await?;
        self.store.views(table_id).await
    }

    pub async fn view(
        &self,
        caller: &CallerId,
        table_id: TableId,
        view_id: ViewId,
    ) -> Result<View, GridError> {
        self.access.authorize(caller, table_id).await?;

        match self.store.view(view_id).await? {
            Some(view) if view.table_id == table_id => Ok(view),
            _ => Err(GridError::NotFound(format!("view {view_id}"))),
        }
    }

    pub async fn default_view(
        &self,
        caller: &CallerId,
        table_id: TableId,
    ) -> Result<Option<View>, GridError> {
        Ok(self
            .views(caller, table_id)
            .await?
            .into_iter()
            .find(|view| view.is_default))
    }
}

#[derive(Clone)]
pub struct CallerGateway {
    gateway: Arc<MutationGateway>,
    caller: CallerId,
}

impl CallerGateway {
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    pub async fn snapshot(&self, table_id: TableId) -> Result<TableSnapshot, GridError> {
        self.gateway.snapshot(&self.caller, table_id).await
    }
}

#[async_trait]
impl MutationSubmitter for CallerGateway {
    async fn submit(&self, mutation: Mutation) -> Result<MutationTicket, GridError> {
        self.gateway.submit(&self.caller, mutation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllowAll, MemoryStore, OwnerAccess, QueueConfig, StoreExecutor};

    fn gateway(store: Arc<MemoryStore>) -> MutationGateway {
        let executor = Arc::new(StoreExecutor::new(store.clone()));
        let queue = QueueManager::new(executor, QueueConfig::immediate()).unwrap();
        MutationGateway::new(store.clone(), Arc::new(OwnerAccess::new(store)), queue)
    }

    #[tokio::test]
    async fn new_table_gets_default_view() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let caller = CallerId::new("alice");

        let table = gateway.create_table(&caller, "  Budget ").await.unwrap();
        let default = gateway.default_view(&caller, table.id).await.unwrap().unwrap();

        assert_eq!(table.name, "Budget");
        assert_eq!(default.name, DEFAULT_VIEW_NAME);
        assert_eq!(gateway.tables(&caller).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejections_never_reach_the_queue() {
        let gateway = gateway(Arc::new(MemoryStore::new()));
        let owner = CallerId::new("alice");
        let table = gateway.create_table(&owner, "Budget").await.unwrap();

        let rename = Mutation::RenameTable {
            table_id: table.id,
            name: "Stolen".to_string(),
        };
        let denied = gateway.submit(&CallerId::new("mallory"), rename).await;

        let blank = Mutation::RenameTable {
            table_id: table.id,
            name: " ".to_string(),
        };
        let invalid = gateway.submit(&owner, blank).await;

        assert!(matches!(&denied, Err(GridError::Unauthorized(_))));
        assert!(matches!(&invalid, Err(GridError::InvalidInput(_))));
        assert!(matches!(&denied, Err(error) if error.is_rejection()));
        assert!(matches!(&invalid, Err(error) if error.is_rejection()));
        assert!(gateway.queue().active_tables().is_empty());
        assert_eq!(gateway.queue().with_tracker(|t| t.recent(10).len()), 0);
    }

    #[tokio::test]
    async fn view_from_another_table_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(StoreExecutor::new(store.clone()));
        let queue = QueueManager::new(executor, QueueConfig::immediate()).unwrap();
        let gateway = MutationGateway::new(store, Arc::new(AllowAll), queue);
        let caller = CallerId::new("alice");

        let first = gateway.create_table(&caller, "First").await.unwrap();
        let second = gateway.create_table(&caller, "Second").await.unwrap();
        let view = gateway.default_view(&caller, first.id).await.unwrap().unwrap();

        let result = gateway.view(&caller, second.id, view.id).await;

        assert!(matches!(result, Err(GridError::NotFound(_))));
    }
}
