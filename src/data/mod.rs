pub mod frame;
pub mod legacy;
pub mod partitioned;
pub mod paths;
pub mod router;

pub use frame::{TIMESTAMP_COL, TRADE_KEY_COLS, TRADE_TIME_COL};
pub use legacy::LegacyStore;
pub use partitioned::PartitionedStore;
pub use paths::PathBuilder;
pub use router::{RouteRequest, StorageRouter};
