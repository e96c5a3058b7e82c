//! A concurrent hash map whose writes are built around an atomic compute step.
//!
//! The map lets many threads read and write at the same time without an external lock.
//! Lookups never block. Every write (insert, remove, and the compute operations) locks only
//! the bin its key hashes to, so writers to different bins do not contend, and writes to an
//! empty bin are claimed with a single compare-and-swap.
//!
//! The central operation is *compute*: the caller is shown the current value of a key (or
//! its absence) and decides, in one indivisible step, what should happen to it. It comes in
//! two flavours:
//!
//!  - [`HashMap::compute`] takes a function returning `Option<V>`: `Some` stores the value,
//!    `None` removes the entry.
//!  - [`HashMap::compute_v2`] takes a function returning a [`ComputeOp`], which in addition
//!    to updating and deleting can leave the entry exactly as it is.
//!
//! ```
//! use compute_map::{ComputeOp, HashMap};
//!
//! let map = HashMap::new();
//! let map = map.pin();
//!
//! // insert if absent, add 42 otherwise
//! let add = |old: Option<&u64>| ComputeOp::Update(old.map_or(42, |v| v + 42));
//! assert_eq!(map.compute_v2("counter", add), (Some(&42), true));
//! assert_eq!(map.compute_v2("counter", add), (Some(&84), true));
//!
//! // leave larger values alone
//! let floor = |old: Option<&u64>| match old {
//!     Some(&v) if v >= 63 => ComputeOp::Noop,
//!     _ => ComputeOp::Update(63),
//! };
//! assert_eq!(map.compute_v2("counter", floor), (Some(&84), true));
//!
//! // remove the entry, getting the old value back
//! assert_eq!(map.compute("counter", |_| None), (Some(&84), false));
//! assert!(map.is_empty());
//! ```
//!
//! The function passed to a compute is called exactly once, while the key's bin is locked.
//! Other writers to the same bin wait for it, so it should be quick, and it must not use the
//! map itself. If it has to report a failure, it can record that in a variable it captures
//! and return [`ComputeOp::Noop`]; the map does not inspect or roll back anything.
//!
//! # Growing
//!
//! The table doubles once it is three quarters full. The migration is spread across threads:
//! any writer that runs into a bin that has already been moved helps move a stride of the
//! remaining bins before retrying, and readers simply follow the moved bin into the new
//! table. Use [`HashMap::with_capacity`] or [`HashMap::reserve`] to size the table ahead of
//! time.
//!
//! # A note on `Guard` and memory use
//!
//! Values that are replaced or removed, and bins and tables that are superseded, are not
//! freed right away: another thread may still be reading them. Instead they are retired to
//! the map's `seize` collector and freed once no thread can still hold a reference to
//! them. The [`Guard`] that every operation takes is what makes this work. References
//! returned by the map live as long as the guard they were obtained under, and anything
//! retired while a guard is alive is kept around until that guard is dropped.
//!
//! Get a guard with [`HashMap::guard`] and pass it to each call, or use [`HashMap::pin`],
//! which bundles a fresh guard with a reference to the map in a [`HashMapRef`]:
//!
//! ```
//! use compute_map::HashMap;
//!
//! let map = HashMap::new();
//!
//! let guard = map.guard();
//! map.insert(1, "one", &guard);
//! assert_eq!(map.get(&1, &guard), Some(&"one"));
//! drop(guard);
//!
//! assert_eq!(map.pin().get(&1), Some(&"one"));
//! ```
//!
//! Holding a guard for a long time keeps retired memory around for that long, so prefer
//! short-lived guards. A guard obtained from one map cannot be used with another; doing so
//! panics.
//!
//! # Logging
//!
//! Table allocation and resizes are reported through the `log` facade at `debug` level,
//! and threads joining a resize at `trace` level. The crate does not install a logger.
#![deny(
    missing_docs,
    missing_debug_implementations,
    unreachable_pub,
    rustdoc::broken_intra_doc_links
)]
#![warn(rust_2018_idioms)]
#![allow(clippy::cognitive_complexity)]

mod compute;
mod map;
mod map_ref;
mod node;
mod raw;
mod reclaim;

#[cfg(feature = "rayon")]
mod rayon_impls;

/// Iterator types.
pub mod iter;

pub use compute::ComputeOp;
pub use map::{HashMap, TryInsertError};
pub use map_ref::HashMapRef;
pub use seize::Guard;

/// Default hasher for [`HashMap`].
pub type DefaultHashBuilder = ahash::RandomState;
