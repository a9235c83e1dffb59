//! Mirror maintenance after installation: ESP synchronization and drive
//! replacement.

pub mod replace;
pub mod sync;
