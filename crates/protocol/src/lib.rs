pub mod config;
pub mod identity;
pub mod messages;

pub use config::*;
pub use identity::*;
pub use messages::*;
