/*! heaps_and_pages is GPU memory middleware: a batching allocator and binding
engine, sparse-residency tracking, and a staging copy engine, sitting between
an application and a low-level graphics API.

Low-level APIs hand you memory heaps, memory types, and bind-this-buffer-there
primitives, then leave the actual strategy to you.  This crate is that
strategy, packaged:

| Concern             | What you get                                                                 |
|---------------------|------------------------------------------------------------------------------|
| Allocation          | One [allocator::Allocator] batch per wave of resources; compatible resources share a heap block |
| Placement           | Heap selection by feature score with fallback on exhaustion                  |
| Dedicated resources | Honored automatically from the device's own hints                            |
| Sparse residency    | Per-page ([resources::SparseBuffer]) and per-tile ([resources::SparseImage]) bind tracking |
| Data movement       | [resources::Buffer::write] and friends pick mapping vs staging per backing   |
| Failure             | `bake` is transactional; a failed batch leaves no partial bindings behind    |

# Lifecycle

Create an [entry_point::EntryPoint], then a [resources::Device], then
resources.  Resources are born without memory; collect them into an
[allocator::Allocator] and call `bake`.  After a successful bake every
resource in the batch is bound, initial data is uploaded, and reads/writes
work.  Sparse resources can additionally be re-bound page by page at any
time, outside any allocator.

Memory lifetimes are reference counts: a heap block lives while any bound
resource, sparse page, or in-flight bake holds it, and is returned to the
device when the last holder drops.

# Backends

The crate is written against a small backend seam (the private `imp`
module).  The default
`backend_soft` feature provides an in-process software device that models
heaps, queues, sparse binding, and transfers faithfully enough to serve as
the test oracle.  A stub backend compiles when the feature is disabled, for
checking that the core stays backend-agnostic.
*/

pub mod allocator;
pub mod entry_point;
mod imp;
pub mod memory;
pub mod residency;
pub mod resources;
mod staging;

pub use allocator::{AddError, Allocator, BakeError};
pub use staging::TransferError;
