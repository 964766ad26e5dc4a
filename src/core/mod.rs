// Core modules: artifact stores, staging, launching, and error modeling.
pub mod activate;
pub mod error;
pub mod launch;
pub mod stage;
pub mod store;
