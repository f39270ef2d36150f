//! Higher-level utilities built on the core atom primitives.

pub mod atom_family;
pub mod optimistic;
