//! Built-in collections consumed by the authentication layer.

use crate::schema::{CollectionSchema, FieldDefinition};
use core_types::FieldType;

pub const AUTH_USERS: &str = "auth_users";
pub const AUTH_SESSIONS: &str = "auth_sessions";
pub const AUTH_TOKENS: &str = "auth_tokens";

pub fn users() -> CollectionSchema {
    CollectionSchema::new(AUTH_USERS)
        .field(FieldDefinition::new("email", FieldType::String).required().unique())
        .field(FieldDefinition::new("username", FieldType::String))
        .field(FieldDefinition::new("password", FieldType::String))
        .field(FieldDefinition::new("role", FieldType::String).required())
        .field(FieldDefinition::new("blocked", FieldType::Boolean))
        .field(FieldDefinition::new("lastAuthMethod", FieldType::String))
        .field(FieldDefinition::new("permissions", FieldType::Array))
}

pub fn sessions() -> CollectionSchema {
    CollectionSchema::new(AUTH_SESSIONS)
        .field(FieldDefinition::new("user_id", FieldType::String).required())
        .field(FieldDefinition::new("expires", FieldType::Date).required())
        .field(FieldDefinition::new("device", FieldType::Json))
}

pub fn tokens() -> CollectionSchema {
    CollectionSchema::new(AUTH_TOKENS)
        .field(FieldDefinition::new("token", FieldType::String).required().unique())
        .field(FieldDefinition::new("user_id", FieldType::String).required())
        .field(FieldDefinition::new("email", FieldType::String))
        .field(FieldDefinition::new("type", FieldType::String).required())
        .field(FieldDefinition::new("expires", FieldType::Date).required())
        .field(FieldDefinition::new("consumed", FieldType::Boolean))
}

pub fn all() -> Vec<CollectionSchema> {
    vec![users(), sessions(), tokens()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ResolvedSchema;

    #[test]
    fn auth_schemas_resolve() {
        for schema in all() {
            let resolved = ResolvedSchema::resolve(&schema).unwrap();
            assert_eq!(resolved.table, schema.id);
        }
        assert_eq!(ResolvedSchema::resolve(&tokens()).unwrap().unique_fields().count(), 1);
    }
}
