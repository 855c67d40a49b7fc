pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{
    AUTH_ADDRESS, KEY, USER, image_id, md5_hex, memory_store, seeded_bytes, store_config,
};
