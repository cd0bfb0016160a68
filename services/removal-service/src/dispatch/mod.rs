pub mod dispatcher;
pub mod result;

pub use dispatcher::{Dispatcher, RemovalOptions};
pub use result::{ApiUsage, RemovalFailure, RemovalMethod, RemovalResult};

#[cfg(test)]
mod tests;
