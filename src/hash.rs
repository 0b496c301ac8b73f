/// Content hashing shared by the image cache, module instances and history.
///
/// Every hash in the catalog is the same djb2-style fold seeded with 5381, so a
/// value computed here can be compared with the ones stored in `history_hash`.

/// Seed of every content hash.
pub const HASH_SEED: u64 = 5381;

/// Fold `bytes` into `seed`.
pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(seed, |hash, &b| (hash << 5).wrapping_add(hash) ^ u64::from(b))
}

/// Incremental hasher for structured values.
///
/// Field order matters: feeding the same values in another order gives another hash.
#[derive(Debug, Clone, Copy)]
pub struct ContentHasher {
    state: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::with_seed(HASH_SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.state = hash_bytes(self.state, bytes);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn f32(&mut self, value: f32) -> &mut Self {
        self.bytes(&value.to_bits().to_le_bytes())
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.bytes(&value.to_bits().to_le_bytes())
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.bytes(&[u8::from(value)])
    }

    /// Strings are length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    pub fn str(&mut self, value: &str) -> &mut Self {
        self.u64(value.len() as u64).bytes(value.as_bytes())
    }

    pub fn opt_f64(&mut self, value: Option<f64>) -> &mut Self {
        match value {
            Some(v) => self.bool(true).f64(v),
            None => self.bool(false),
        }
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}
