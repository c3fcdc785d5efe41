pub mod cluster;
pub mod remote;
pub mod step;
