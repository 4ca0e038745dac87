//! tapereplay
//!
//! Deterministic market-replay and brokerage-simulation engine: a virtual
//! clock, an ordered multi-stream event queue, an NBBO-driven matching
//! engine, a margin-aware brokerage account, and a session manager that
//! coordinates many independent replays concurrently.
//!
//! Protocol adapters (broker-compatible REST/WebSocket façades), the UI,
//! and the concrete database driver behind `DataSource` are external
//! collaborators and out of scope for this crate.

pub mod engine;
