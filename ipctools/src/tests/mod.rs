use std::sync::atomic::{AtomicUsize, Ordering};

use crate::segment::ShmemConfig;

mod stress_tests;

/// A segment config with a name no other test or test run will use.
pub(crate) fn test_config(tag: &str, size: usize) -> ShmemConfig {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "t_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    ShmemConfig::new(name, size)
}
