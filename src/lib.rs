pub mod ci;
pub mod config;
pub mod constants;
pub mod environment;
pub mod errors;
pub mod launcher;
pub mod modes;
#[cfg(test)]
pub(crate) mod testing;
pub mod util;
