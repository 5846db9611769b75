//! Caller identity handed over by the upstream authentication layer.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ControlError;
use crate::models::VmRecord;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
}

impl Role {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("admin") {
            Self::Admin
        } else {
            Self::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

#[cfg(test)]
impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins may act on any VM, everyone else only on their own.
    pub fn can_access(&self, record: &VmRecord) -> bool {
        self.is_admin() || self.id == record.owner
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ControlError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let id = header(USER_ID_HEADER).ok_or(ControlError::Unauthenticated)?;
        let role = header(USER_ROLE_HEADER).map_or(Role::User, Role::parse);
        Ok(Self {
            id: id.to_string(),
            role,
        })
    }
}
