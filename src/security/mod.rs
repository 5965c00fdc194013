pub mod audit_log;
pub mod cookie;
pub mod session;
