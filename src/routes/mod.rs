pub mod assets;

pub use assets::{asset_service, font_cache_middleware};
