//! Subscription billing core: plan catalog, subscription phase
//! lifecycle, usage-based price calculation and invoicing.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
