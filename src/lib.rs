//! # farm-publish
//!
//! Delayed and remote publishing for VFX pipelines.
//!
//! A publish collects instances from a host application, validates them,
//! and extracts each one into a new version on shared storage. Extraction
//! that is too expensive for the artist's machine is delegated: the session
//! is dumped to JSON next to the reserved versions, a contractor (a
//! Deadline render farm, or a local subprocess) receives self-contained
//! jobs, and a resume run on the worker finishes extraction and integrates
//! the versions from the dumps alone.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────┐        ┌──────────────┐
//! │ Collect  │──▶│ Validate  │──▶│ Extract   │───────▶│  Integrate   │
//! │ manifest │   │ atomicity │   │ reserve v │ local  │ VersionStore │
//! └──────────┘   └───────────┘   └─────┬─────┘        └──────▲───────┘
//!                                      │ delegated           │
//!                                      ▼                     │
//!                            ┌──────────────────┐   ┌────────┴────────┐
//!                            │ dumps + contract │──▶│ resume (worker) │
//!                            └──────────────────┘   └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fpub init                                  # create the version store
//! fpub publish ./chair.publish.json          # publish from a host manifest
//! fpub resume /mnt/projects/dumps/.context.ana.<id>.json   # on a farm worker
//! fpub dumps                                 # find unfinished delegated publishes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed publish failures and exit codes |
//! | [`ids`] | Time-sortable ids |
//! | [`fingerprint`] | Content fingerprints of mesh streams |
//! | [`instance`] | Instance records and dependency descriptors |
//! | [`session`] | Publish session state and results log |
//! | [`dump`] | Instance, extractor and context dump files |
//! | [`traits`] | Plugin, extractor, contractor and host traits plus registries |
//! | [`plugins`] | Builtin collectors, validators and extract plugins |
//! | [`extractors`] | Builtin extractor callables |
//! | [`publish`] | Local phase orchestration |
//! | [`integrate`] | Version integration |
//! | [`contractor_deadline`] | Deadline farm contractor |
//! | [`contractor_local`] | Local subprocess contractor |
//! | [`resume`] | Resume from dumps |
//! | [`host`] | Standalone host adapter |
//! | [`inspect`] | Dump and version listings |
//! | [`store`] | Version store trait and in-memory backend |
//! | [`sqlite_store`] | SQLite version store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod contractor_deadline;
pub mod contractor_local;
pub mod db;
pub mod dump;
pub mod error;
pub mod extractors;
pub mod fingerprint;
pub mod host;
pub mod ids;
pub mod inspect;
pub mod instance;
pub mod integrate;
pub mod migrate;
pub mod plugins;
pub mod publish;
pub mod resume;
pub mod session;
pub mod sqlite_store;
pub mod store;
pub mod traits;
