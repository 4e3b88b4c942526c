pub mod bot;
pub mod data;
pub mod hit;
pub mod proxy;

pub use bot::*;
pub use data::*;
pub use hit::*;
pub use proxy::*;
