use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::observability;
use crate::tenant::tenant_slug;

/// One shared password; the database name must be a usable tenant slug.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let database = login.database().unwrap_or("default");
        if let Err(e) = tenant_slug(database) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!(user = login.user().unwrap_or(""), database, "rejected login: {e}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "3D000".into(),
                format!("invalid database {database:?}: {e}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
