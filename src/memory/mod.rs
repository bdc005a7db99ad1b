pub(crate) mod integration;
pub(crate) mod overrun;
pub(crate) mod page_list;
pub(crate) mod record;
pub(crate) mod small_pages;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
