#![allow(clippy::doc_markdown)]

//! sls-hooks - handlers the kernel and udev run when something breaks
//!
//! Each handler stages one artifact for the daemon and then nudges it with
//! a non-blocking `trigger`.
//!
//! - [`coredump`]: `core_pattern` pipe target producing minidumps
//! - [`devcoredump`]: device coredump archiver
//! - [`gpu`]: GPU reset reporter
//! - [`notify`]: privilege drop and daemon notification

pub mod coredump;
pub mod devcoredump;
pub mod gpu;
pub mod notify;
