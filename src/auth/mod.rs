pub mod detection;
pub mod hmac_auth;

pub use hmac_auth::HmacAuthenticator;
