pub mod config;
pub mod error;
pub mod host;
pub mod layer;
pub mod load;
pub mod renderer;
pub mod volume;

#[cfg(test)]
mod testing;

pub use config::*;
pub use error::*;
pub use host::*;
pub use layer::*;
pub use renderer::*;
pub use volume::*;
