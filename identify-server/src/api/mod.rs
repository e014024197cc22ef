//! HTTP API handlers for identify-server

pub mod contacts;
pub mod health;
pub mod identify;

pub use contacts::get_contact;
pub use health::health_routes;
pub use identify::identify;
