//! # flexlru
//!
//! Cost-weighted LRU list used by the Flex render cache.
//!
//! ## Architecture
//! - **Arena**: values live in a slot vector, addressed by generation-checked
//!   [`NodeId`]s instead of pointers
//! - **LRU List**: doubly-linked through slot indices, O(1) touch and unlink
//! - **Budget**: every node carries a cost; exceeding the maximum total evicts
//!   from the cold end down to a lower target (hysteresis)
//!
//! The list never owns any knowledge of where its values are referenced from.
//! Evicted values are handed back to the caller, which detaches them from
//! whatever structure points at them.

#![warn(missing_docs)]

mod list;

pub use list::{Admission, Iter, LruLimits, LruList, NodeId, Weighted};
