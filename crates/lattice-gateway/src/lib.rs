pub mod connection;
pub mod registry;

pub use connection::GatewayContext;
pub use registry::ConnectionRegistry;
