pub mod reconcile;
pub mod repo;
pub mod schema;
