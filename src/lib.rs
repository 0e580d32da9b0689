//! Live production hub: a session-scoped signaling relay for controller,
//! camera and display participants, the negotiation endpoints that run over
//! it, and an RTMP bridge pushing browser media to streaming platforms.

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod helpers;
pub mod models;
pub mod negotiation;
pub mod registry;
pub mod roles;
pub mod state;
pub mod types;
pub mod utils;
