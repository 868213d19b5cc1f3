mod kv_db;
mod meta;
mod records;
pub mod tuple;

pub use kv_db::*;
pub use meta::*;
pub use records::{
    local_key, new_prefix_id, parse_local_key, File, Location, PrefixId, TAG_CONFIG, TAG_FILE,
    TAG_LOCATION, TAG_LOCATION_LIST, TAG_WAL, TAG_WAL_LEGACY,
};

#[cfg(test)]
mod test_meta;

#[macro_use]
extern crate log;
