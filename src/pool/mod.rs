//! Segregated-Storage Memory Pool
//!
//! Fixed-size-class allocator: every size class gets its own arena serving
//! same-size slots from bump-allocated blocks, with freed slots recycled
//! through an intrusive free list.
//!
//! # Architecture
//!
//! ```text
//! SlabPool
//!   ├─→ SlotArena(8B)    → free list → bump cursor → block chain
//!   ├─→ SlotArena(16B)   → free list → bump cursor → block chain
//!   ├─→ ... 64 classes, 8-byte granularity ...
//!   └─→ SlotArena(512B)  → free list → bump cursor → block chain
//!
//! requests > 512B ──→ general-purpose allocator (fallback)
//! request == 0    ──→ None, no arena touched
//! ```
//!
//! Allocation order inside an arena: reclaimed slots first (strict LIFO),
//! then the bump cursor, and a new block only when both are exhausted.
//! Typed construction (`create`/`destroy`, [`PoolBox`]) sits on top and is
//! the only place where object lifecycle meets raw slots.

pub mod allocator;
pub mod arena;
pub mod bench;
pub mod block;
mod free_list;
pub mod size_class;
pub mod typed;

pub use allocator::{shared, PoolStats, SlabPool};
pub use arena::{ArenaStats, SlotArena};
pub use block::{BlockSource, SystemSource};
pub use size_class::{
    class_index, slot_size, CLASS_COUNT, DEFAULT_BLOCK_SIZE, MAX_POOLED_SIZE, SLOT_UNIT,
};
pub use typed::PoolBox;
