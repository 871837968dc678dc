pub mod db_pool;
pub mod executor;
pub mod schema;
pub mod seed;
