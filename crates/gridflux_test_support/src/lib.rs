pub mod faulty_store;
pub mod fixtures;
pub mod scripted_executor;

pub use faulty_store::{FaultyStore, FaultyStoreStats};
pub use scripted_executor::{ExecutionRecord, ScriptedExecutor};
