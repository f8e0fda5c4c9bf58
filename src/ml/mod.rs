#[cfg(feature = "nsfw")]
pub mod engine;
#[cfg(feature = "nsfw")]
pub mod pipeline;
pub mod scorer;
