pub mod task_scope;

#[cfg(feature = "test-utils")]
pub mod testing;
