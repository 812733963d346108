pub mod ed2k;
pub mod paths;
pub mod time;
