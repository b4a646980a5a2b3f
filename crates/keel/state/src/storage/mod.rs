//! State storage backends

mod file;
mod memory;
mod traits;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use traits::StateStore;
