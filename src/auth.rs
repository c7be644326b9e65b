use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

/// Every client authenticates with the shared API key as its password.
#[derive(Debug)]
pub struct ApiKeyAuthSource {
    api_key: String,
}

impl ApiKeyAuthSource {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl AuthSource for ApiKeyAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.api_key.as_bytes().to_vec()))
    }
}

/// The acting user for permission checks: the login name, when it is a user id.
/// Any other login name connects anonymously.
pub fn acting_user(login_name: Option<&str>) -> Option<Ulid> {
    login_name.and_then(|name| Ulid::from_string(name).ok())
}
