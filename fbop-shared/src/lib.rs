pub mod api;
pub mod auth;
pub mod code;
pub mod domain;
pub mod jwt;
pub mod money;
