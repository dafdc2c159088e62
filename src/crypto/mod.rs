pub mod evm;
pub mod substrate;

pub use evm::{is_evm_address, verify_evm};
pub use substrate::verify_substrate;
