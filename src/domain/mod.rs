pub mod batch;
pub mod models;
