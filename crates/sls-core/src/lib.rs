#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! sls-core - SteamOS log submitter core library
//!
//! Everything the daemon and the hooks share: the staged-artifact store,
//! its locks, layered configuration, persistent helper state, the control
//! socket protocol and client, the submission helpers and the runner that
//! drives them.
//!
//! # Modules
//!
//! - [`lockfile`]: self-identifying per-category filesystem locks
//! - [`staging`]: `pending/`, `uploaded/` and `failed/` hierarchy with
//!   atomic transitions
//! - [`config`]: layered TOML configuration with a writable local layer
//! - [`data`]: per-module JSON state
//! - [`helpers`]: the helper trait, registry and every built-in helper
//! - [`runner`]: collect and submit cycles
//! - [`remote`]: Sentry and Steam crash upload back-ends
//! - [`ipc`]: line-delimited JSON wire protocol
//! - [`client`]: synchronous control-socket client
//! - [`process`]: `/proc` walks for Steam appids
//! - [`system`]: probes for branch, Mesa and the kernel journal
//! - [`log`]: tracing setup with a reloadable level
//! - [`util`]: name escaping, case conversion and report ids

pub mod client;
pub mod config;
pub mod data;
pub mod helpers;
pub mod ipc;
pub mod lockfile;
pub mod log;
pub mod process;
pub mod remote;
pub mod runner;
pub mod staging;
pub mod system;
pub mod util;

pub use helpers::{Helper, HelperContext, HelperResult, Registry, Services};
pub use runner::Runner;
