pub mod locator;
pub mod priority;
pub mod probe;
pub mod registry;
pub mod traits;
pub mod types;
