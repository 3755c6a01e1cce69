//! HTTP admin server for a tiered-swap node.
//!
//! - [`admin_api`]: Request/response types and route handlers

pub mod admin_api;
