pub mod casegen;
pub mod inventory;
pub mod monitor;
pub mod pbs_alloc;
pub mod placement;
pub mod probe;
pub mod report;
pub mod scripts;
pub mod template;
pub mod transport;
pub mod workflow;
