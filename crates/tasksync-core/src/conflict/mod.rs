//! Conflict detection and resolution

mod detector;
mod store;

pub use detector::detect;
pub use store::ConflictStore;
