//! HTTP front end for remote collaborators. Each request maps onto one
//! session operation of the `load_governor` core.

pub mod routes;
pub mod session_manager;

pub use routes::configure;
pub use session_manager::SessionRegistry;
