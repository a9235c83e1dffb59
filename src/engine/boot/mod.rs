//! Everything that decides how the new system boots: the shared ESP identity,
//! the generated boot artifacts and the first-boot safety net.

pub mod agent;
pub mod bootstrap;
pub mod esp;
pub mod templates;
