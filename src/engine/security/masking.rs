//! Data Masking
//!
//! Read-boundary value transforms for sensitive fields. Masks are applied to
//! decrypted plaintext on the way out and are never persisted.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::engine::canonical::Record;
use crate::engine::context::RequestContext;

pub const REDACTED: &str = "[REDACTED]";
pub const RESTRICTED: &str = "[RESTRICTED]";

/// Fields hidden from anyone but the record owner
const OWNER_ONLY_FIELDS: &[&str] = &["salary", "health_info"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
    Redact,
}

impl MaskKind {
    pub fn apply(&self, value: &str) -> String {
        match self {
            MaskKind::Email => mask_email(value),
            MaskKind::Phone => mask_phone(value),
            MaskKind::Ssn => mask_ssn(value),
            MaskKind::CreditCard => mask_credit_card(value),
            MaskKind::Redact => REDACTED.to_string(),
        }
    }
}

/// Global rules by field name. A trailing `*` matches any suffix.
const GLOBAL_RULES: &[(&str, MaskKind)] = &[
    ("email", MaskKind::Email),
    ("phone", MaskKind::Phone),
    ("ssn", MaskKind::Ssn),
    ("credit_card", MaskKind::CreditCard),
    ("password", MaskKind::Redact),
    ("ssn_*", MaskKind::Ssn),
    ("card_*", MaskKind::CreditCard),
];

fn infer_mask(field: &str) -> Option<MaskKind> {
    GLOBAL_RULES.iter().find_map(|(pattern, kind)| {
        let hit = match pattern.strip_suffix('*') {
            Some(prefix) => field.starts_with(prefix),
            None => *pattern == field,
        };
        hit.then_some(*kind)
    })
}

/// Masking rules, global plus per model
#[derive(Default)]
pub struct DataMasking {
    models: RwLock<HashMap<String, BTreeMap<String, MaskKind>>>,
}

impl DataMasking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model-specific rules take precedence over global inference.
    pub fn register_model(&self, model: &str, rules: BTreeMap<String, MaskKind>) {
        self.models.write().insert(model.to_string(), rules);
    }

    /// Mask a record for the given caller. `extra` rules (from model metadata)
    /// are consulted after the registered model rules.
    pub fn mask(&self, model: &str, record: Record, extra: &BTreeMap<String, MaskKind>, ctx: &RequestContext) -> Record {
        let models = self.models.read();
        let registered = models.get(model);

        let mut out = Record::with_capacity(record.len());
        for (field, value) in record {
            if value.is_null() {
                out.insert(field, value);
                continue;
            }
            let kind = registered
                .and_then(|rules| rules.get(&field).copied())
                .or_else(|| extra.get(&field).copied())
                .or_else(|| infer_mask(&field));

            let masked = match kind {
                Some(kind) => Value::String(kind.apply(&display_text(&value))),
                None => value,
            };
            out.insert(field, masked);
        }

        if ctx.actor_id.is_some() && ctx.tenant_id.is_some() {
            apply_owner_masking(&mut out, ctx);
        }
        out
    }
}

fn apply_owner_masking(record: &mut Record, ctx: &RequestContext) {
    let Some(owner) = record.get("owner_id") else {
        return;
    };
    if owner.as_str() == ctx.actor_id.as_deref() {
        return;
    }
    for field in OWNER_ONLY_FIELDS {
        if let Some(value) = record.get_mut(*field) {
            *value = Value::String(RESTRICTED.to_string());
        }
    }
}

fn display_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn stars(n: usize) -> String {
    "*".repeat(n)
}

fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return email.to_string();
    };
    let chars: Vec<char> = local.chars().collect();
    let masked_local = if chars.len() <= 2 {
        stars(chars.len())
    } else {
        format!("{}{}{}", chars[0], stars(chars.len() - 2), chars[chars.len() - 1])
    };
    format!("{}@{}", masked_local, domain)
}

fn mask_phone(phone: &str) -> String {
    let d = digits(phone);
    if d.len() <= 4 {
        return stars(d.len());
    }
    format!("{}{}", stars(d.len() - 4), &d[d.len() - 4..])
}

fn mask_ssn(ssn: &str) -> String {
    let d = digits(ssn);
    if d.len() >= 4 {
        format!("***-**-{}", &d[d.len() - 4..])
    } else {
        stars(d.len())
    }
}

fn mask_credit_card(card: &str) -> String {
    let d = digits(card);
    if d.len() <= 4 {
        return stars(d.len());
    }
    format!("**** **** **** {}", &d[d.len() - 4..])
}
