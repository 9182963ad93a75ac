//! Attach-time scanning for UBI-formatted flash media.
//!
//! Given a raw erase-block device, [`ubi::attach`] reads the two on-flash
//! headers of every PEB, classifies each block, reconciles duplicate copies
//! of logical eraseblocks, and hands back an [`ubi::AttachInfo`] snapshot
//! that downstream layers (wear-leveling, LEB mapping, the volume table)
//! consume to initialize themselves.
//!
//! The [`mtd`] module defines the device interface this crate drives, plus
//! an in-memory simulator used throughout the tests.

pub mod mtd;
pub mod ubi;
