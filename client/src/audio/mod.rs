pub mod opus;
pub mod playback;
pub mod source;
