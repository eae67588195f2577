pub mod clock;
pub mod context;
pub mod decoder;
pub mod device;
pub mod driver;
pub mod library;
pub mod mixer;
pub mod session;
pub mod sfx;
pub mod streaming;

#[cfg(test)]
pub(crate) mod test_support;
