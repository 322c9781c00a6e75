pub mod common;
pub mod gc;
pub mod nodes;
pub mod serve;
