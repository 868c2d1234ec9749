pub mod command;
pub mod dispatch;
pub mod registry;
pub mod store;
