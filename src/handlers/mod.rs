//! HTTP handlers for projects, lifecycle commands and synthesized data routes.

pub mod data;
pub mod projects;
