pub mod app;
pub mod atlas;
pub mod config;
pub mod dataverse;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod gene;
pub mod manifest;
pub mod output;
pub mod provenance;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod tui;
