//! Authorization tiers and normalization of the backend's role representations

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Admin,
    FieldOfficer,
    Farmer,
    Owner,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoleError {
    #[error("Unknown role name: {0}")]
    UnknownName(String),

    #[error("Unrecognized role representation: {0}")]
    UnrecognizedShape(String),
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::FieldOfficer => "fieldofficer",
            Role::Farmer => "farmer",
            Role::Owner => "owner",
        }
    }

    /// Case-insensitive parse of a role name
    pub fn parse(name: &str) -> Option<Role> {
        match name.trim().to_ascii_lowercase().as_str() {
            "manager" => Some(Role::Manager),
            "admin" => Some(Role::Admin),
            "fieldofficer" => Some(Role::FieldOfficer),
            "farmer" => Some(Role::Farmer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    /// Backend role ids. Ids outside the table fall back to `Farmer`.
    pub fn from_id(id: i64) -> Role {
        match id {
            1 => Role::Manager,
            2 => Role::Admin,
            3 => Role::FieldOfficer,
            4 => Role::Owner,
            5 => Role::Farmer,
            _ => Role::Farmer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the role from a user object returned by the backend.
///
/// Accepted shapes: `{role: {name}}`, `{role: {id}}`, `{role: "name"}`, `{role: id}`
/// and `{role_id: id}`.
pub fn normalize_role(user: &Value) -> Result<Role, RoleError> {
    match user.get("role") {
        Some(Value::Object(role)) => {
            if let Some(name) = role.get("name").and_then(Value::as_str) {
                return from_name(name);
            }
            if let Some(id) = role.get("id").and_then(as_role_id) {
                return Ok(Role::from_id(id));
            }
            Err(RoleError::UnrecognizedShape(Value::Object(role.clone()).to_string()))
        }
        Some(Value::String(name)) => from_name(name),
        Some(value @ Value::Number(_)) => as_role_id(value)
            .map(Role::from_id)
            .ok_or_else(|| RoleError::UnrecognizedShape(value.to_string())),
        Some(Value::Null) | None => match user.get("role_id").and_then(as_role_id) {
            Some(id) => Ok(Role::from_id(id)),
            None => Err(RoleError::UnrecognizedShape(
                user.get("role_id")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "missing role".to_string()),
            )),
        },
        Some(other) => Err(RoleError::UnrecognizedShape(other.to_string())),
    }
}

fn from_name(name: &str) -> Result<Role, RoleError> {
    Role::parse(name).ok_or_else(|| RoleError::UnknownName(name.to_string()))
}

fn as_role_id(value: &Value) -> Option<i64> {
    value.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_owner_shapes_normalize_to_owner() {
        let shapes = vec![
            json!({"role": {"name": "Owner"}}),
            json!({"role": {"id": 4}}),
            json!({"role": "OWNER"}),
            json!({"role_id": 4}),
            json!({"role": 4}),
        ];

        for shape in shapes {
            assert_eq!(normalize_role(&shape), Ok(Role::Owner), "shape {}", shape);
        }
    }

    #[test]
    fn test_unmapped_id_defaults_to_farmer() {
        assert_eq!(normalize_role(&json!({"role": {"id": 99}})), Ok(Role::Farmer));
        assert_eq!(normalize_role(&json!({"role_id": 0})), Ok(Role::Farmer));
    }

    #[test]
    fn test_name_takes_precedence_over_id() {
        let user = json!({"role": {"id": 4, "name": "Admin"}});
        assert_eq!(normalize_role(&user), Ok(Role::Admin));
    }

    #[test]
    fn test_unknown_name_is_fatal() {
        assert!(matches!(
            normalize_role(&json!({"role": "superuser"})),
            Err(RoleError::UnknownName(_))
        ));
    }

    #[test]
    fn test_unrecognized_shapes_are_fatal() {
        for user in [
            json!({"username": "no-role"}),
            json!({"role": [1, 2]}),
            json!({"role": {"label": "owner"}}),
            json!({"role": true}),
            json!({"role_id": "4"}),
        ] {
            assert!(
                matches!(normalize_role(&user), Err(RoleError::UnrecognizedShape(_))),
                "expected failure for {}",
                user
            );
        }
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&Role::FieldOfficer).unwrap(), "\"fieldofficer\"");
        assert_eq!(Role::parse(" FieldOfficer "), Some(Role::FieldOfficer));
        assert_eq!(Role::Owner.to_string(), "owner");
    }
}
