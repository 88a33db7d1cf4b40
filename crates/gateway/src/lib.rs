pub mod bus_relay;
pub mod connection;
pub mod hub;
pub mod router;
pub mod shutdown;

pub use hub::Hub;
pub use router::AppState;
