pub mod join_token;
pub mod jwt;
pub mod middleware;
pub mod primary;
