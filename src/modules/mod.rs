pub mod content;
pub mod jobs;
pub mod playback;
pub mod upload;
