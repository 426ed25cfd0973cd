pub mod aggregator;
pub mod cache;

pub use aggregator::{generate_final_archive, wrap_archive};
pub use cache::{final_container_path, get_or_generate, wrapped_archive_path};
