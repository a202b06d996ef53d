pub mod chunk;
pub mod health;
pub mod performance;
pub mod scan;
pub mod voxel_map;

pub use chunk::get_voxel_map_chunk;
pub use health::hello;
pub use performance::get_performance;
pub use scan::{get_scan_status, start_scan};
pub use voxel_map::preprocess_voxel_map;
