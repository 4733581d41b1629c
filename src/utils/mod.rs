pub mod message;
pub mod sequence;
pub mod serial;
