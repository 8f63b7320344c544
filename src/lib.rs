pub mod config;
pub mod fingerprint;
pub mod forward;
pub mod hooks;
pub mod interaction;
pub mod logging;
pub mod proxy;
pub mod store;
