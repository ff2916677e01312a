// vim: tw=80

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Errno names are conventionally all caps.
#![allow(clippy::upper_case_acronyms)]

pub mod bookmark;
pub mod ddt;
pub mod errorscrub;
pub mod ext_tree;
pub mod governor;
pub mod io_queue;
pub mod phys;
pub mod pool;
pub mod prefetch;
pub mod scan;
pub mod scrub;
pub mod stats;
pub mod store;
pub mod traverse;
pub mod tunables;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
