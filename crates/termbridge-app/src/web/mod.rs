// Web frontend module
pub mod decoder;
pub mod handler;
pub mod routes;
pub mod server;

pub use decoder::{Decoded, OutputDecoder};
pub use routes::{create_router, AppState};
pub use server::{WebServer, WebServerConfig};
