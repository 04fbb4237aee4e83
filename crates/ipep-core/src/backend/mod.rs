//! Built-in host backends
//!
//! - [`MemoryHost`]: in-process host model
//! - [`FileHost`]: JSON inventory file
//!
//! Platform backends live in their own crates and register a
//! [`BackendFactory`](crate::traits::BackendFactory) with the
//! [`BackendRegistry`](crate::registry::BackendRegistry).

pub mod file;
pub mod memory;

pub use file::{FileFactory, FileHost};
pub use memory::{MemoryFactory, MemoryHost};
