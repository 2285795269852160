//! FeedSync — sync engine
//!
//! Everything between a provider response and the canonical store: live and
//! odds caches, cross-provider matching, the event lifecycle, market sync,
//! settlement, the stale sweep and the per-provider polling engine.

pub mod engine;
pub mod live_cache;
pub mod markets;
pub mod matching;
pub mod odds_cache;
pub mod reconcile;
pub mod scheduler;
pub mod settlement;
pub mod stale_sweep;
pub mod state_machine;
pub mod synthetic;

pub use engine::{EngineConfig, EngineDeps, PollSummary, ProviderEngine, TickReport};
pub use live_cache::{LiveCacheConfig, LiveEventCache};
pub use markets::{MarketSynchronizer, SyncReport};
pub use odds_cache::OddsCache;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use scheduler::{PollKind, PollScheduler, PollTask, SchedulerConfig};
pub use settlement::{ScoreOrigin, SettleSource, SettlementEngine, SettlementOutcome};
pub use stale_sweep::{StaleSweepConfig, StaleSweeper, SweepReport};
pub use state_machine::Transition;
pub use synthetic::{SyntheticOdds, SyntheticOddsConfig};
