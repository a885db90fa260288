pub mod pool;
pub mod tx;

pub use pool::*;
pub use tx::*;
