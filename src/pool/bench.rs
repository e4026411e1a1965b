//! Benchmarks comparing the pool against the global allocator
