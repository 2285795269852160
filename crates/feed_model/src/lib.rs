//! FeedSync — canonical model
//!
//! Sports, competitions, events, markets and selections as the pipeline stores
//! them, the error taxonomy shared by every stage, and the collaborator ports
//! (store, broadcast, job queue, clock).

pub mod error;
pub mod memory;
pub mod ports;
pub mod stop;
pub mod types;

pub use error::{FeedError, FeedResult, StoreError, StoreResult};
pub use ports::{Clock, JobQueue, ManualClock, NullPublisher, Publisher, Store, SystemClock, AUTO_SETTLE_EVENT};
pub use stop::StopFlag;
pub use types::*;
