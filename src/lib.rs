//! Staged, idempotent installer for the Incus container manager.
//!
//! An install run is an ordered [`pipeline::Pipeline`] of stages. Each stage
//! checks whether its effect is already in place, acts if not, and verifies
//! the result. A fatal failure halts the run and replays the rollback journal
//! for what this run created.
//!
//! ```text
//! config (defaults → file → flags → prompts)
//!     │
//!     ├── preflight: privilege, host tools
//!     ├── preseed: storage directory, init document
//!     └── stages::build_plan ──> pipeline::Pipeline::run
//!                                   │
//!                                   ├── runner: package manager, systemctl, make
//!                                   ├── fetch: keys, Go toolchain
//!                                   └── mutate: files, sysctl, id ranges
//! ```
//!
//! Everything external goes through [`runner::CommandRunner`] and every path
//! through [`host::HostRoot`], so whole runs can be exercised against a
//! scratch directory with [`runner::mock::MockRunner`].

pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod installer;
pub mod mutate;
pub mod pipeline;
pub mod preflight;
pub mod preseed;
pub mod runner;
pub mod stage;
pub mod stages;

pub use config::{InstallMethod, InstallationConfig};
pub use error::InstallError;
pub use installer::{InstallReport, Installer};
