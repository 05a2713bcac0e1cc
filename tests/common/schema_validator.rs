use jsonschema::{Draft, JSONSchema};
use serde_json::{Value, json};

/// Compile an inline JSON schema
pub fn compile(schema: &Value) -> JSONSchema {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .expect("Failed to compile schema")
}

/// Validate a JSON value against a schema
pub fn validate_against_schema(data: &Value, schema: &JSONSchema) -> Result<(), Vec<String>> {
    match schema.validate(data) {
        Ok(_) => Ok(()),
        Err(errors) => {
            let error_messages: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            Err(error_messages)
        }
    }
}

/// JRD returned by Webfinger
pub fn webfinger_schema() -> JSONSchema {
    compile(&json!({
        "type": "object",
        "required": ["subject", "links"],
        "properties": {
            "subject": {"type": "string", "pattern": "^acct:"},
            "aliases": {"type": "array", "items": {"type": "string"}},
            "links": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["rel"],
                    "properties": {
                        "rel": {"type": "string"},
                        "type": {"type": "string"},
                        "href": {"type": "string"},
                        "template": {"type": "string"}
                    }
                }
            }
        }
    }))
}

/// NodeInfo 2.1 document (the parts we fill in)
pub fn nodeinfo_schema() -> JSONSchema {
    compile(&json!({
        "type": "object",
        "required": ["version", "software", "protocols", "usage", "openRegistrations"],
        "properties": {
            "version": {"const": "2.1"},
            "software": {
                "type": "object",
                "required": ["name", "version"],
                "properties": {
                    "name": {"type": "string", "pattern": "^[a-z0-9-]+$"},
                    "version": {"type": "string"}
                }
            },
            "protocols": {"type": "array", "contains": {"const": "activitypub"}},
            "usage": {
                "type": "object",
                "required": ["users"],
                "properties": {
                    "users": {
                        "type": "object",
                        "properties": {"total": {"type": "integer", "minimum": 0}}
                    },
                    "localPosts": {"type": "integer", "minimum": 0}
                }
            },
            "openRegistrations": {"type": "boolean"}
        }
    }))
}

/// ActivityStreams Person served for a blog
pub fn person_schema() -> JSONSchema {
    compile(&json!({
        "type": "object",
        "required": ["@context", "id", "type", "inbox", "preferredUsername", "publicKey"],
        "properties": {
            "id": {"type": "string"},
            "type": {"const": "Person"},
            "inbox": {"type": "string"},
            "publicKey": {
                "type": "object",
                "required": ["id", "owner", "publicKeyPem"],
                "properties": {
                    "publicKeyPem": {"type": "string", "pattern": "BEGIN PUBLIC KEY"}
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_schema_validation() {
        let schema = compile(&json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "name": {"type": "string"}
            },
            "required": ["id"]
        }));

        let valid_data = json!({"id": "123", "name": "Test"});
        assert!(validate_against_schema(&valid_data, &schema).is_ok());

        let invalid_data = json!({"name": "Test"});
        assert!(validate_against_schema(&invalid_data, &schema).is_err());
    }
}
