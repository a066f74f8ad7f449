pub mod circuit;
pub mod handlers;
pub mod ingest;
pub mod middleware;
pub mod routes;
pub mod tickets;

pub use routes::create_router;
