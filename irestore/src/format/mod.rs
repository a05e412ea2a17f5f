//! Pure codecs for the firmware container formats handled during a restore

pub mod cpio;
pub mod fls;
pub mod ftab;
pub mod mbn;
