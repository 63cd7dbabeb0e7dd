pub mod logger;
pub mod summary;
