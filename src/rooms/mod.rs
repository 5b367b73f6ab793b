pub mod access;
pub mod crud;
pub mod join_code;
pub mod sessions;
