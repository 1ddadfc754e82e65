pub mod archive;
pub mod artifact_fetch;
pub mod backup;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod files;
pub mod fs_scope;
pub mod http_api;
pub mod liveness;
pub mod process_manager;
pub mod provision;
pub mod pty_shell;
pub mod startup;
pub mod task_registry;
pub mod tenant_store;
pub mod transcript;

#[cfg(test)]
mod testing;
