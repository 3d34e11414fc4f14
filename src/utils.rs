mod rand_compat;
pub(crate) mod serde;

pub(crate) use rand_compat::generate_signing_key;
pub(crate) use serde::serialize;
