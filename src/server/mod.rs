pub mod handlers;
pub mod metrics;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
