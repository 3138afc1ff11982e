pub mod concurrency;
pub mod database;
pub mod mtr;
pub mod storage;
