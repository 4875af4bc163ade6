//! Peon services — build orchestration, status reporting and change sources.

pub mod cache_service;
pub mod deploy_service;
pub mod dispatcher;
pub mod environment;
pub mod executor;
pub mod git_service;
pub mod github_service;
pub mod legacy_import;
pub mod manifest;
pub mod pipeline;
pub mod render_service;
pub mod status_pages;
pub mod status_service;
pub mod step_executor;
pub mod watcher;
