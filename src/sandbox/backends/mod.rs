pub mod docker;
pub mod local;
