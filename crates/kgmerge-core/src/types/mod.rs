//! Core types for kgmerge.

mod canonical;
mod entity;
mod relation;
mod value;

pub use canonical::*;
pub use entity::*;
pub use relation::*;
pub use value::*;
