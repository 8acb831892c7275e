//! Authentication: JWT claims carrying the tenant, the caller, and the HOD
//! capability that gates session commits.

pub mod jwt;
pub mod middleware;

pub use jwt::JwtHandler;
pub use middleware::auth_middleware;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller role; `Hod` and `Admin` carry the privileged-commit capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Crew,
    Hod,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Crew => "crew",
            Role::Hod => "hod",
            Role::Admin => "admin",
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Hod | Role::Admin)
    }
}

/// Validated token claims, attached to the request by the auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Caller user id.
    pub sub: Uuid,
    /// Tenant scope for every repository call on this request.
    pub yacht_id: Uuid,
    pub role: Role,
    pub exp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_capability() {
        assert!(!Role::Crew.is_privileged());
        assert!(Role::Hod.is_privileged());
        assert!(Role::Admin.is_privileged());
    }
}
