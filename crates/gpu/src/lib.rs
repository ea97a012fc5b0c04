pub mod atlas;
pub mod uniforms;

pub use atlas::*;
pub use uniforms::*;
