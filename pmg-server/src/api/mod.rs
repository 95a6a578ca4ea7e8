//! HTTP API handlers for pmg-server

pub mod buildinfo;
pub mod files;
pub mod generate;
pub mod health;
pub mod sequence;
pub mod ui;
pub mod upload;

pub use buildinfo::get_build_info;
pub use files::download_file;
pub use generate::generate;
pub use health::health_routes;
pub use sequence::{clear_sequence, get_sequence};
pub use ui::ui_routes;
pub use upload::upload_midi;
