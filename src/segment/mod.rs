//! Segment-based inverted index
//!
//! Immutable segments produced by flushes and merges, plus the in-memory
//! buffer that feeds them.
//!
//! # Architecture
//!
//! - `MutableBuffer`: sequenced documents not yet flushed
//! - `SegmentBuilder` / `merge_segments`: produce a new segment and its files
//! - `Segment`: immutable postings, columns, range trees and stored documents,
//!   with a copy-on-write live bitset
//! - `SegmentStore` / `SegmentManifest`: on-disk layout, published atomically
//! - `TieredMergePolicy` / `MergeScheduler`: choose and serialize merges

mod types;
mod statistics;
mod buffer;
mod postings;
mod term_dict;
mod docvalues;
mod docno_map;
mod range_index;
mod stored;
mod reader;
mod writer;
mod manifest;
mod store;
mod merge;

pub use types::*;
pub use statistics::*;
pub use buffer::*;
pub use postings::*;
pub use term_dict::*;
pub use docvalues::*;
pub use docno_map::*;
pub use range_index::*;
pub use stored::*;
pub use reader::*;
pub use writer::*;
pub use manifest::*;
pub use store::*;
pub use merge::*;
