pub mod logging;
pub mod sim_cluster;
