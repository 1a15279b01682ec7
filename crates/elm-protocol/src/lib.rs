pub mod candidates;
pub mod dtc;
pub mod protocol;
pub mod session;
pub mod vin;

pub use candidates::*;
pub use dtc::*;
pub use protocol::*;
pub use session::*;
pub use vin::*;
