pub mod catalog;
pub mod runtime;
