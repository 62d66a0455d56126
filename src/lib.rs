mod axfs_lib;

pub use axfs_lib::*;
