pub mod catalog;
pub mod changelog;
pub mod core;
pub mod imports;
pub mod setup;
