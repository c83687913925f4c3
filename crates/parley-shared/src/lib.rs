pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod presence;
pub mod protocol;
pub mod rest;
pub mod types;
