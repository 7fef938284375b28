pub mod attach;
pub mod compiler;
pub mod ebpf_loader;
pub mod error;
pub mod events;
pub mod model;
pub mod packet;
pub mod sink;
pub mod store;

pub use error::{Error, Result};
