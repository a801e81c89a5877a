pub mod access;
pub mod manager;
pub mod saved;

pub use access::AccessChecker;
pub use manager::ConnectionManager;
pub use saved::{SavedConnection, SavedConnectionRegistry};
