use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(0);

/// Returns the next transaction id.
///
/// Ids are unique and monotonically increasing for the lifetime of the
/// process. They correlate log lines and patcher callbacks belonging to one
/// transaction; they carry no ordering guarantee across transactions.
pub fn next_id() -> u64 {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod test {
    use super::next_id;

    #[test]
    fn ids_are_strictly_increasing() {
        let first = next_id();
        let second = next_id();
        let third = next_id();
        assert!(second > first);
        assert!(third > second);
    }
}
