pub mod capability;
pub mod resolve;
pub mod store;

pub use capability::{has_capability, CapabilityMap};
pub use resolve::{resolve_connect, AuthFailure, AuthOutcome, ConnectQuery};
pub use store::{ApiKeyRecord, ApiKeyStore};
