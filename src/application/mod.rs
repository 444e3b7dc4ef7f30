pub mod closer;
pub mod ingest;
pub mod persister;
pub mod session;
pub mod store;
pub mod volatility;
