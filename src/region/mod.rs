//! Regional band parameters. Only CN470 is served by this core.

pub mod cn470;

pub use cn470::{Cn470Mode, Cn470Region, DataRate};
