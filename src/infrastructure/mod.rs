pub mod credentials;
pub mod decode;
pub mod feed;
pub mod timeconv;
pub mod universe;
