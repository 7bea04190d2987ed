#![forbid(unsafe_code)]

use inventory_kernel_contracts::asset::{AssetFields, TrackedField};
use unicode_normalization::UnicodeNormalization;

/// A fixed-shape struct whose fields can be enumerated and rendered as text for auditing.
pub trait TrackedFields {
    type Field: Copy + 'static;

    fn tracked() -> &'static [Self::Field];
    fn label(field: Self::Field) -> &'static str;
    fn text_of(&self, field: Self::Field) -> String;
}

impl TrackedFields for AssetFields {
    type Field = TrackedField;

    fn tracked() -> &'static [TrackedField] {
        &TrackedField::ALL
    }

    fn label(field: TrackedField) -> &'static str {
        field.label()
    }

    fn text_of(&self, field: TrackedField) -> String {
        AssetFields::text_of(self, field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange<F> {
    pub field: F,
    pub label: &'static str,
    pub old_value: String,
    pub new_value: String,
}

/// NFC + surrounding whitespace trimmed. Absent values arrive here as "".
pub fn normalize_field_text(value: &str) -> String {
    value.nfc().collect::<String>().trim().to_string()
}

/// One change per tracked field whose normalized text differs, in declaration order.
pub fn diff_fields<T: TrackedFields>(old: &T, new: &T) -> Vec<FieldChange<T::Field>> {
    T::tracked()
        .iter()
        .filter_map(|&field| {
            let old_value = normalize_field_text(&old.text_of(field));
            let new_value = normalize_field_text(&new.text_of(field));
            (old_value != new_value).then(|| FieldChange {
                field,
                label: T::label(field),
                old_value,
                new_value,
            })
        })
        .collect()
}
