pub mod account;
pub mod delivery;
pub mod exchange;
pub mod order;
pub mod signal;
pub mod task;
pub mod webhook;
