//! Utility
pub(crate) mod intrusive_list;
#[cfg(test)]
pub(crate) mod mock;
mod prio_bitmap;
pub use self::prio_bitmap::*;
