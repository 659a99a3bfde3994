//! Config HTTPS API: router, security middleware, handlers, and the
//! embedded SPA shell.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod static_files;
pub mod ws;

pub use routes::create_router;
