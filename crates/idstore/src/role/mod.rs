//! Role Aggregate

pub mod entity;
pub mod store;

pub use entity::Role;
pub use store::RoleStore;
