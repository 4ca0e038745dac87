//! Deterministic market-replay and brokerage-simulation engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SessionManager                           │
//! │   (registry + fan-out; each session owns its engines below)     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ DataSource  │        │ TimeEngine  │        │ Performance │
//! │ (replay)    │        │ (nanos)     │        │  Tracker    │
//! └─────────────┘        └─────────────┘        └─────────────┘
//!        │                       │
//!        └───────────┬───────────┘
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EventQueue                               │
//! │   bounded BinaryHeap<(ts, priority, seq)>, overflow-aware        │
//! └─────────────────────────────────────────────────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │ Execution   │───▶│ Matching    │───▶│ Account     │
//! │ Policy      │    │ Engine      │    │ Manager     │
//! └─────────────┘    └─────────────┘    └─────────────┘
//! ```
//!
//! # Determinism guarantees
//!
//! - **TimeEngine**: never calls system time; all time comes from the
//!   virtual clock.
//! - **EventQueue**: `(ts, event priority, arrival seq)` ordering.
//! - **Market impact**: a pure linear function of fill size and participation
//!   rate, no randomness involved.
//! - **DataSource**: no-lookahead; never yields a record past the point
//!   it was asked for.

pub mod account;
pub mod clock;
pub mod config;
pub mod data_source;
pub mod error;
pub mod events;
pub mod execution_policy;
pub mod matching;
pub mod order;
pub mod queue;
pub mod rate_limiter;
pub mod session;
pub mod session_manager;

pub use account::{AccountManager, AccountState};
pub use clock::{ClockState, Nanos, TimeEngine};
pub use config::EngineConfig;
pub use data_source::{DataSource, InMemoryDataSource};
pub use error::{EngineError, EngineResult};
pub use events::{Event, EventData, EventType, MarketEvent};
pub use execution_policy::{ExecutionPolicy, MarketSession};
pub use matching::{MatchingEngine, OrderRequest};
pub use order::{Order, OrderStatus};
pub use queue::{EventQueue, OverflowPolicy};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use session::{Session, SessionConfig, SessionStatus};
pub use session_manager::SessionManager;
