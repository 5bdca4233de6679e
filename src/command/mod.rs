pub mod backend;
pub mod list;
pub mod provision;
pub mod remove;
