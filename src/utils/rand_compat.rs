//! Key generation for cluster signers.
//!
//! `ed25519-dalek` 2 draws signing keys from a `rand_core` 0.6 generator while the
//! rest of the crate uses rand 0.9. [`RngCompat`] adapts the thread-local rand 0.9
//! CSPRNG to the older traits so [`generate_signing_key`] can feed it to
//! `SigningKey::generate`.
use ed25519_dalek::SigningKey;
use rand::{CryptoRng, RngCore, rngs::ThreadRng};

/// A fresh signing key drawn from the thread-local CSPRNG.
pub(crate) fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut RngCompat(rand::rng()))
}

/// Exposes a rand 0.9 generator through the rand_core 0.6 traits.
struct RngCompat<R = ThreadRng>(R);

impl<R: RngCore> rand_core_0_6::RngCore for RngCompat<R> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core_0_6::Error> {
        // rand 0.9 generators are infallible
        self.0.fill_bytes(dest);
        Ok(())
    }
}

impl<R: CryptoRng> rand_core_0_6::CryptoRng for RngCompat<R> {}
