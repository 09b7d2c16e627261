//! HTTPS listener with handshake-time certificate selection
//!
//! Also provides the plain HTTP side: ACME HTTP-01 responses and redirects.

pub mod handler;
pub mod http01;
pub mod server;

pub use handler::RouterHandler;
pub use server::{
    BoundHttpsServer, ClientStream, ConnectionHandler, HttpsServer, HttpsServerConfig,
    HttpsServerError,
};
