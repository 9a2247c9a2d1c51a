pub mod types;
pub mod error;
pub mod config;
pub mod remote_call;

pub use types::*;
pub use error::*;
pub use config::*;
pub use remote_call::*;
