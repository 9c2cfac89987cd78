pub mod errors;
pub mod models;

pub use errors::*;
pub use models::*;

/// Install the `env_logger` backend once; `RUST_LOG` overrides the `info` default
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
