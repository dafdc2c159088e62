pub mod migrations;
pub mod store;

pub use store::{Binding, BindingOutcome, Store, UpsertVote};
