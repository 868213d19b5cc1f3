// multi_store spreads every object over several chunk stores with
// Reed-Solomon parity, and keeps placement healthy in the background.

mod background;
mod cache;
mod config;
mod finder;
mod meta_task;
mod multi;

pub use background::*;
pub use cache::*;
pub use config::*;
pub use finder::*;
pub use multi::*;

#[cfg(test)]
mod test_multi;

#[macro_use]
extern crate log;
