pub mod bloom;

pub use bloom::BloomFilterPolicy;

pub const SEED: u32 = 0xc7b4e193;

/// Builds and probes the per-table filter block. A policy may answer "maybe"
/// for keys it never saw, but must never answer "no" for a key it was given.
pub trait FilterPolicy: Send + Sync {
    /// Persisted next to the filter data; a reader with a different policy
    /// name ignores the filter.
    fn name(&self) -> &'static str;

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}
