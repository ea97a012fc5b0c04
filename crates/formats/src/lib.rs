pub mod volume_pack;

pub use volume_pack::*;
