//! Cross-component and multithreaded tests: the concurrency properties the
//! pools promise (capacity bounds, no double-issue, terminal exhaustion)
//! exercised with real threads. Exhaustive interleaving coverage lives in
//! `loom_tests.rs`.
