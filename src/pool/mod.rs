pub(crate) mod allocator;
pub(crate) mod global;
pub(crate) mod mempool;
pub(crate) mod page;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
