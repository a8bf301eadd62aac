pub mod error;
pub mod models;

pub use error::{PidoneError, Result};
pub use models::*;
