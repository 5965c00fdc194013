pub mod local_api;
pub mod session_layer;
