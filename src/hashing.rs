//! The internal key hash used to navigate hashed tries.
//!
//! This is a manual expansion of the canonical whole-key hash the runtime
//! uses when it builds a map (see `NativeRuntime::make_map_hash`). Hash
//! values determine trie shape, so the two copies must stay bit-identical:
//! whenever the algorithm over there changes, this module must follow
//! suit. The cross-check lives in `tests/map_ops.rs`.

use cfg_if::cfg_if;

pub const INTERNAL_HASH_SALT: u32 = 3432918353;
pub const HCONST_22: u32 = 0x98C475E6;
pub const HCONST: u32 = 0x9E3779B9;

/// Which implementation of the mix function a `HashEngine` runs.
///
/// Both produce a 32-bit hash from the same inputs, but they are different
/// functions: a trie built under one must never be read under the other.
/// The choice is made once at startup and held for the life of the session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// Hardware CRC32C folding.
    Crc32c,
    /// Portable 9-round mix, no hardware requirements.
    Portable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HashEngine {
    kind: EngineKind,
}

impl HashEngine {
    /// Pick the engine for this process: accelerated when the hardware has
    /// it, portable otherwise. The `portable-hash` feature forces portable.
    pub fn select() -> Self {
        if cfg!(feature = "portable-hash") {
            return Self::portable();
        }
        Self::accelerated().unwrap_or_else(Self::portable)
    }

    pub fn portable() -> Self {
        HashEngine {
            kind: EngineKind::Portable,
        }
    }

    /// The CRC32C engine, if this machine can run it.
    pub fn accelerated() -> Option<Self> {
        if crc32c_available() {
            Some(HashEngine {
                kind: EngineKind::Crc32c,
            })
        } else {
            None
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// One round of the key hash: fold a 64-bit quantity (as two 32-bit
    /// halves) and a round constant into an incoming hash.
    pub fn mix(&self, lower: u32, upper: u32, constant: u32, hash: u32) -> u32 {
        match self.kind {
            EngineKind::Portable => portable_mix(lower, upper, constant, hash),
            // Safety: the Crc32c engine is only constructed after
            // `crc32c_available` reported the feature present.
            EngineKind::Crc32c => unsafe { crc32c_mix(lower, upper, constant, hash) },
        }
    }

    /// The hash a key is looked up with at the trie root.
    pub fn element_hash(&self, key: u64) -> u32 {
        self.mix(key as u32, (key >> 32) as u32, HCONST, INTERNAL_HASH_SALT)
    }

    /// The fresh hash derived when a descent exhausts its 32 bits. `depth`
    /// is the number of levels consumed so far, always a multiple of 8.
    /// Seeding with `depth >> 3` makes the hash path-dependent.
    pub fn path_hash(&self, depth: u32, key: u64) -> u32 {
        let seed = self.mix(depth >> 3, 1, HCONST_22, 0) ^ INTERNAL_HASH_SALT;
        self.mix(key as u32, (key >> 32) as u32, HCONST, seed)
    }
}

/// The portable mix: nine rounds of subtract-and-shift-xor over
/// `(a, b, c)`, rotating which variable is the target. The round order and
/// shift amounts are load-bearing; changing any of them reshapes every
/// hashed trie in existence.
fn portable_mix(lower: u32, upper: u32, constant: u32, hash: u32) -> u32 {
    let mut a = lower.wrapping_add(constant);
    let mut b = upper.wrapping_add(constant);
    let mut c = hash;

    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 13;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 8;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 13;
    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 12;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 16;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 5;
    a = a.wrapping_sub(b).wrapping_sub(c);
    a ^= c >> 3;
    b = b.wrapping_sub(c).wrapping_sub(a);
    b ^= a << 10;
    c = c.wrapping_sub(a).wrapping_sub(b);
    c ^= b >> 15;

    c
}

cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        fn crc32c_available() -> bool {
            std::arch::is_aarch64_feature_detected!("crc")
        }

        #[target_feature(enable = "crc")]
        unsafe fn crc32c_mix(lower: u32, upper: u32, constant: u32, hash: u32) -> u32 {
            use std::arch::aarch64::__crc32cw;
            let lower = lower.wrapping_add(constant);
            let upper = upper.wrapping_add(constant);
            let folded = __crc32cw(hash, lower);
            let hash = hash.wrapping_add(folded);
            __crc32cw(hash, upper)
        }
    } else if #[cfg(target_arch = "x86_64")] {
        fn crc32c_available() -> bool {
            std::arch::is_x86_feature_detected!("sse4.2")
        }

        #[target_feature(enable = "sse4.2")]
        unsafe fn crc32c_mix(lower: u32, upper: u32, constant: u32, hash: u32) -> u32 {
            use std::arch::x86_64::_mm_crc32_u32;
            let lower = lower.wrapping_add(constant);
            let upper = upper.wrapping_add(constant);
            let folded = _mm_crc32_u32(hash, lower);
            let hash = hash.wrapping_add(folded);
            _mm_crc32_u32(hash, upper)
        }
    } else {
        fn crc32c_available() -> bool {
            false
        }

        // Never constructible on this architecture; present so `mix` has
        // something to call in the (dead) Crc32c arm.
        unsafe fn crc32c_mix(lower: u32, upper: u32, constant: u32, hash: u32) -> u32 {
            portable_mix(lower, upper, constant, hash)
        }
    }
}
