pub mod blake3_hasher;

pub use blake3_hasher::Blake3Hasher;
