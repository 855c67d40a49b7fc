use bytes::Bytes;
use depot_core::SwiftStoreConfig;
use depot_storage::{MemorySwift, SwiftStore};
use md5::{Digest, Md5};
use std::sync::Arc;

pub const USER: &str = "user";
pub const KEY: &str = "key";
pub const AUTH_ADDRESS: &str = "localhost:8080";

/// Compute MD5 of data as hex string
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// A fresh image id.
pub fn image_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Complete credentials against `localhost:8080`, container `glance`.
pub fn store_config() -> SwiftStoreConfig {
    SwiftStoreConfig {
        user: Some(USER.to_string()),
        key: Some(KEY.to_string()),
        auth_address: Some(AUTH_ADDRESS.to_string()),
        ..Default::default()
    }
}

/// A store over an in-memory Swift account.
///
/// The configured container is created up front when `create_container` is set.
pub fn memory_store(
    config: SwiftStoreConfig,
    create_container: bool,
) -> (SwiftStore, Arc<MemorySwift>) {
    let swift = Arc::new(MemorySwift::new());
    if create_container {
        swift.create_container(&config.container);
    }
    let store = SwiftStore::new(&config, swift.clone()).unwrap();
    (store, swift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(&[b'*'; 5120]), "c2e5db72bd7fd153f53ede5da5a06de3");
    }

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 1000), seeded_bytes(42, 1000));
        assert_ne!(seeded_bytes(42, 1000), seeded_bytes(43, 1000));
    }
}
