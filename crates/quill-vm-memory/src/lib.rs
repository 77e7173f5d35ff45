//! Object memory manager for the Quill VM.
//!
//! A generational heap for a managed-language runtime: a copying young
//! generation fed by per-context bump slabs, a region-based mature
//! generation with census-driven evacuation, and a non-moving large object
//! space. A rotating mark sentinel lets cycles skip the heap-wide unmark
//! pass, a remembered-set write barrier keeps young collections independent
//! of the mature heap, and mature marking can run on a dedicated concurrent
//! thread. Object headers carry an inline lock word that inflates to an
//! out-of-line record for contention, identity ids and native handles;
//! finalization and code-resource cleanup ride on the collection cycles.
//!
//! [`ObjectMemory`] is the entry point; each mutator thread works through
//! its own [`ExecutionContext`].

pub mod barrier;
pub mod code;
pub mod config;
pub mod error;
pub mod finalize;
pub mod handles;
pub mod headers;
pub mod large;
pub mod marker;
pub mod mature;
pub mod memory;
pub mod object;
pub mod slab;
pub mod space;
pub mod young;

pub use code::CodeResource;
pub use config::MemoryConfig;
pub use error::{LockStatus, MemoryError};
pub use finalize::FinalizerKind;
pub use handles::Handle;
pub use memory::{ExecutionContext, GcInhibit, MemoryStats, ObjectMemory};
pub use object::{ObjectRef, Zone};
