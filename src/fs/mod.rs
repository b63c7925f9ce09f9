//! Filesystem integration
//!
//! The VM layer only needs a narrow view of a file: its size, positioned
//! reads and writes, and a slot where the inode remembers its shared VM
//! object. That view is the `Inode` trait.

pub mod inode;

pub use inode::{Inode, InodeError, InodeIdentifier, RamInode, SharedVmObjectSlot};
