//! Terminal screens shared by the binaries.

mod error;
mod fold_until_stop;

pub use error::MonitorError;
pub use fold_until_stop::fold_until_stop;
