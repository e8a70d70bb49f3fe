//! Sablier gate - a reverse proxy that holds traffic until backends are ready
//!
//! For every inbound request the gate:
//! - Resolves the route's variable templates against the request
//! - Builds a readiness check for the Sablier control service, choosing the
//!   dynamic (waiting page) or blocking strategy
//! - Forwards the request to its upstream when the session is `ready`
//! - Otherwise returns the control service's reply to the client unchanged

pub mod admin;
pub mod config;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod pool;
pub mod proxy;
pub mod routes;
pub mod strategy;
pub mod variables;
