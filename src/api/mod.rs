//! HTTP API for the secret volume service.
//!
//! ## Endpoints
//!
//! - `GET /` - List volumes
//! - `POST /` - Create a volume (body carries the credential)
//! - `GET /:id` - Describe a volume
//! - `DELETE /:id` - Destroy a volume

mod routes;
mod volumes;

pub use routes::{build_manager, router, serve, AppState};
