pub mod auth;
pub mod candidates;
pub mod core;
pub mod members;
mod params;
pub mod posts;
