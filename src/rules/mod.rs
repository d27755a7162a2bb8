pub mod store;

pub use store::{RuleStore, RuleStoreError};
