//! API key storage.

pub mod keyring;
