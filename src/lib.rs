//! # grantmatch
//!
//! Grant discovery for community organisations: pull funding opportunities
//! from a government grants portal, score them against a user's projects,
//! and track the applications that follow.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ Sync client  │──▶│ Normalise  │──▶│  SQLite   │
//! │ API → scrape │   │ + upsert   │   │  grants   │
//! └──────────────┘   └────────────┘   └────┬─────┘
//!                                          │
//!                  ┌───────────────────────┤
//!                  ▼                       ▼
//!            ┌──────────┐           ┌─────────────┐
//!            │ Matcher  │──────────▶│   Tracker   │
//!            │ projects │  matches  │ applications│
//!            └──────────┘           └─────────────┘
//! ```
//!
//! Every operation is available from the `grantmatch` CLI and the HTTP API
//! in [`server`].
//!
//! ## Quick Start
//!
//! ```bash
//! grantmatch init
//! grantmatch sync --sample
//! grantmatch project create --owner alice --name "Reading Corner" --category education --need 40000
//! grantmatch match <project-id>
//! grantmatch apply <project-id> SG-001
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`traits`] | `GrantSource` and the fallback chain |
//! | [`connector_api`] | JSON API source |
//! | [`connector_scrape`] | HTML listing source |
//! | [`connector_sample`] | Built-in sample grants |
//! | [`normalize`] | Raw record → canonical grant |
//! | [`ingest`] | Sync pipeline and idempotent upsert |
//! | [`grants`] | Browse, lookup, agencies, deadlines |
//! | [`projects`] | Projects and user profiles |
//! | [`matcher`] | Scoring, ranking, match persistence |
//! | [`tracker`] | Application state machine |
//! | [`stats`] | Database overview |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_api;
pub mod connector_sample;
pub mod connector_scrape;
pub mod db;
pub mod error;
pub mod grants;
pub mod ingest;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod projects;
pub mod server;
pub mod stats;
pub mod tracker;
pub mod traits;
