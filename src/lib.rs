//! Routekeeper - a control plane for an nginx reverse proxy
//!
//! This library keeps a registry of backend nodes and the public entry points
//! that forward to them, and keeps a running proxy in step with it:
//! - Nodes register themselves and later update their endpoints over an HTTP API
//! - Every change is rendered into proxy configuration files and persisted
//!   before the proxy is told to reload
//! - The proxy process is supervised; its output is streamed onto the log
//! - Access to the API is gated by capabilities resolved from bearer tokens

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod render;
pub mod state;
pub mod supervisor;
