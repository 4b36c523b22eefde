//! Power Flow Aggregation
//!
//! Rolls raw device readings up into solar/grid/genset/load totals, carrying a
//! category's last value forward across batches in which it did not report.

pub mod engine;
pub mod snapshot;

pub use engine::{AggregateState, AggregationEngine, BatchAggregate};
pub use snapshot::{round2, AggregateSnapshot, FlowStatus, FreshCategories};
