//! Structural redaction of named fields inside JSON payloads.

use std::collections::BTreeSet;

use serde_json::Value;

pub const MASK_TOKEN: &str = "******";

/// Always active, whatever a call adds on top.
pub const DEFAULT_MASK_FIELDS: [&str; 9] = [
    "password",
    "oldPassword",
    "newPassword",
    "newPasswordAgain",
    "token",
    "access_token",
    "refresh_token",
    "secret",
    "key",
];

/// Case-insensitive set of field names whose values get replaced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaskFields {
    names: BTreeSet<String>,
}

impl MaskFields {
    pub fn with_defaults() -> Self {
        Self::empty().with(DEFAULT_MASK_FIELDS)
    }

    pub fn empty() -> Self {
        Self {
            names: BTreeSet::new(),
        }
    }

    /// Union with `extra`; blank entries are ignored.
    pub fn with<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in extra {
            let name = name.as_ref().trim();
            if !name.is_empty() {
                self.names.insert(name.to_lowercase());
            }
        }
        self
    }

    pub fn contains(&self, field: &str) -> bool {
        self.names.contains(&field.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for MaskFields {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Masked {
    pub value: Value,
    /// Fields whose value actually changed.
    pub redactions: usize,
}

impl Masked {
    pub fn altered(&self) -> bool {
        self.redactions > 0
    }
}

/// Never fails; scalars and unmatched keys pass through untouched.
pub fn mask(value: Value, fields: &MaskFields) -> Masked {
    let mut value = value;
    let redactions = mask_in_place(&mut value, fields);
    Masked { value, redactions }
}

fn mask_in_place(value: &mut Value, fields: &MaskFields) -> usize {
    match value {
        Value::Object(map) => map
            .iter_mut()
            .map(|(key, child)| {
                if fields.contains(key) {
                    redact(child)
                } else {
                    mask_in_place(child, fields)
                }
            })
            .sum(),
        Value::Array(items) => items
            .iter_mut()
            .map(|child| mask_in_place(child, fields))
            .sum(),
        _ => 0,
    }
}

fn redact(value: &mut Value) -> usize {
    if value.as_str() == Some(MASK_TOKEN) {
        return 0;
    }
    *value = Value::String(MASK_TOKEN.to_string());
    1
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_are_always_present() {
        let fields = MaskFields::with_defaults().with(["cardNumber"]);
        assert!(fields.contains("PASSWORD"));
        assert!(fields.contains("access_token"));
        assert!(fields.contains("cardnumber"));
        assert_eq!(fields.len(), DEFAULT_MASK_FIELDS.len() + 1);
    }

    #[test]
    fn masks_nested_fields_case_insensitively() {
        let raw = json!({
            "user": {"name": "ana", "Password": "hunter2"},
            "sessions": [{"TOKEN": "abc"}, {"token": {"nested": true}}],
            "note": "password is not a key here"
        });
        let masked = mask(raw, &MaskFields::with_defaults());

        assert_eq!(masked.redactions, 3);
        assert_eq!(masked.value["user"]["Password"], MASK_TOKEN);
        assert_eq!(masked.value["user"]["name"], "ana");
        assert_eq!(masked.value["sessions"][0]["TOKEN"], MASK_TOKEN);
        assert_eq!(masked.value["sessions"][1]["token"], MASK_TOKEN);
        assert_eq!(masked.value["note"], "password is not a key here");
    }

    #[test]
    fn scalars_pass_through() {
        let masked = mask(json!("secret"), &MaskFields::with_defaults());
        assert_eq!(masked.value, json!("secret"));
        assert!(!masked.altered());
    }

    #[test]
    fn masking_is_idempotent() {
        let fields = MaskFields::with_defaults().with(["ssn"]);
        let once = mask(json!({"ssn": 123, "secret": [1, 2], "keep": 1}), &fields);
        let twice = mask(once.value.clone(), &fields);

        assert!(once.altered());
        assert_eq!(twice.value, once.value);
        assert!(!twice.altered());
    }
}
