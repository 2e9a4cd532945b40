//! codeloop: run an AI coding agent through a fixed change-submission
//! pipeline (clone, plan, implement, review, commit, push, pull request) and
//! supervise those runs from a single host.

pub mod config;
pub mod driver;
pub mod errors;
pub mod logstream;
pub mod notify;
pub mod phase;
pub mod pr;
pub mod registry;
pub mod run;
pub mod supervisor;
pub mod util;
