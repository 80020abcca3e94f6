pub(crate) mod buddy;
pub(crate) mod config;
pub(crate) mod global;
pub(crate) mod heap;
pub(crate) mod region;
pub(crate) mod slob;
pub(crate) mod stats;

#[cfg(test)]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
