pub mod backend;
pub mod cache;
pub mod request;
pub mod window;

pub use backend::*;
pub use cache::*;
pub use request::*;
pub use window::*;
