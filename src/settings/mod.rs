pub mod error;
pub mod loader;
pub mod model;
mod raw;

pub use error::SettingsError;
pub use loader::{load_default, resolve_root};
pub use model::*;
