//! Profile-driven mod deployment.
//!
//! Staged mods are indexed ([`mod_index`]), ordered per profile
//! ([`library`]), resolved into one winner per relative path
//! ([`conflicts`]), and linked or copied into a target directory
//! ([`deploy`]). Everything written to the target is recorded in a
//! per-target manifest ([`manifest`]) so it can be verified and removed
//! again ([`undeploy`]) without touching files stagehand does not own.

pub mod app;
pub mod backup;
pub mod cli;
pub mod config;
pub mod conflicts;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod library;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod mod_index;
pub mod ownership;
pub mod task;
pub mod undeploy;
