//! Upload service for the weft bundling platform.
//!
//! Accepts streamed data items, reserves credit against the payment
//! service, persists bytes and metadata, and drives the asynchronous
//! fulfillment pipeline: `plan → prepare → post → verify`, with side
//! jobs for optical hand-off, offset persistence, and cleanup.

pub mod bundle;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod metrics;
pub mod multipart;
pub mod optical;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod store;
