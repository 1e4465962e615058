pub mod oauth_access_token;
pub mod oauth_authorize_code;
pub mod oauth_client;
pub mod oauth_user;
