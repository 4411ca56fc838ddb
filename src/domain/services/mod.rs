pub mod account_selector;
pub mod credential_vault;
pub mod keyed_locks;
pub mod payload_normalizer;
pub mod positions_cache;
pub mod signature;
