//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into caller-facing APIs.
//! - Keep callers decoupled from transaction and engine details.

pub mod cell_service;
