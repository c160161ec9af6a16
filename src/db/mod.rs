mod connection;
mod error;
mod mapper;
mod row;

pub use connection::*;
pub use error::*;
pub use mapper::*;
pub use row::*;
