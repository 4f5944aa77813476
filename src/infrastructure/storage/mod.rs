pub mod object;
pub mod s3;
