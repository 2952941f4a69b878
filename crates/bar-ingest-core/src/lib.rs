pub mod candle;
pub mod error;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod window;
