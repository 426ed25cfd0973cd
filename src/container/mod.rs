pub mod assembler;
pub mod builder;

pub use builder::{ContainerBuilder, CONTAINER_MIME_TYPE};
