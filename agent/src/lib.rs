//! Piped agent library
//!
//! Watches git repositories for application changes, turns them into
//! deployments and drives each deployment through its pipeline while
//! reporting progress to the control plane.

pub mod app;
pub mod cache;
pub mod commandstore;
pub mod config;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod filesys;
pub mod git;
pub mod http;
pub mod logpersister;
pub mod logs;
pub mod metadatastore;
pub mod notifier;
pub mod storage;
pub mod trigger;
pub mod utils;
