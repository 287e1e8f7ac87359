//! # model-selector
//!
//! A rate-limit-aware model selection controller for a host coding-agent
//! process. It watches live usage across several remote model providers,
//! maps usage buckets to concrete models via user configuration, and picks
//! the best currently-available model — coordinating with other running
//! instances through an advisory file lock so they don't collide on the
//! same rate-limited model.
//!
//! ## Pipeline
//!
//! ```text
//!  probes (C1) ──▶ aggregator (C2) ──▶ candidates (C3) ──▶ ranker (C4)
//!                                           │                   │
//!                                     cooldown (C5)       lock (C6)
//!                                           └─────────┬─────────┘
//!                                                      ▼
//!                                                selector (C7)
//! ```
//!
//! ## Modules
//! - `types`: core data model (`ProviderId`, `RateWindow`, `UsageSnapshot`, `UsageCandidate`)
//! - `config`: user-maintained mapping/priority/fallback configuration
//! - `host`: trait boundaries to the host process (model registry, auth storage, notifications)
//! - `probes`: one usage probe per provider (C1)
//! - `aggregator`: concurrent probe fan-out (C2)
//! - `candidates`: candidate construction, combine groups, mapping lookup (C3)
//! - `ranker`: priority-ordered comparison (C4)
//! - `cooldown`: persisted rate-limit cooldown tracking (C5)
//! - `lock`: cross-process advisory model lock (C6)
//! - `selector`: end-to-end orchestration (C7)

pub mod aggregator;
pub mod candidates;
pub mod config;
pub mod cooldown;
pub mod host;
pub mod lock;
pub mod probes;
pub mod ranker;
pub mod selector;
pub mod types;
pub mod util;

pub use config::{ConfigProvider, LoadedConfig};
pub use selector::{run_selector, SelectionReason, SelectorDeps, SelectorError, SelectorOptions};
pub use types::{ProviderId, RateWindow, UsageCandidate, UsageSnapshot};
