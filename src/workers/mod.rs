pub mod encoder;
pub mod maintenance;
pub mod transcoder;
