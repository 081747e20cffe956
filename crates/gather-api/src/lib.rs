pub mod auth;
pub mod conversations;
pub mod middleware;
pub mod users;
