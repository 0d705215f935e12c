pub mod db;
pub mod igdb;
pub mod jobs;
pub mod models;
pub mod scheduler;
pub mod staleness;
pub mod steam;
pub mod steamgriddb;
pub mod store;
pub mod sync_chain;
pub mod worker;
