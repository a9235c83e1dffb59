// Engine functionality
pub mod context;
pub mod install;
pub mod interrupt;
pub mod recovery;
pub mod session;
pub mod status;
pub mod system;

// Components
pub mod boot;
pub mod mirror;
pub mod storage;
