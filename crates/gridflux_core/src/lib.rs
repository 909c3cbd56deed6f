mod access;
mod batch;
mod config;
mod error;
mod executor;
mod gateway;
mod memory_store;
mod model;
mod mutation;
mod optimistic;
mod queue;
mod session;
mod store;
mod tracker;

pub use access::{AccessControl, AllowAll, OwnerAccess};
pub use batch::{BatchSink, CellBatchWriter, CellEdit, StructureGate, StructureGuard};
pub use config::{BatchConfig, GridConfig, GridConfigStore, QueueConfig};
pub use error::GridError;
pub use executor::{IdMap, MutationExecutor, StoreExecutor};
pub use gateway::{CallerGateway, DEFAULT_VIEW_NAME, MutationGateway, MutationSubmitter};
pub use memory_store::MemoryStore;
pub use model::{
    CallerId, Cell, CellValue, Column, ColumnFilter, ColumnId, ColumnPinning, ColumnType,
    EntityId, NewView, OptimisticId, Row, RowId, SortSpec, Table, TableId, TableSnapshot, View,
    ViewConfig, ViewId, ViewPatch,
};
pub use mutation::{CellChange, Mutation, MutationKind, MutationOutcome, Target};
pub use optimistic::{
    ClientColumn, ClientRow, ClientView, GridState, LocalId, Provisional, Removed,
};
pub use queue::{MutationFailure, MutationTicket, QueueManager, Settlement};
pub use session::{AcceptAll, GridSession, SubmitPolicy};
pub use store::RecordStore;
pub use tracker::{CancelToken, MutationId, MutationSnapshot, MutationStatus, MutationTracker};
