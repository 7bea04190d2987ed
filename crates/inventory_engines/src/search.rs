#![forbid(unsafe_code)]

use inventory_kernel_contracts::asset::{AssetRecordView, TrackedField};
use inventory_kernel_contracts::history::HistoryView;

use crate::diff::normalize_field_text;

fn fold(value: &str) -> String {
    normalize_field_text(value).to_lowercase()
}

/// Case-insensitive substring match; blank terms match everything.
fn any_column_contains<'a>(columns: impl IntoIterator<Item = &'a str>, term: &str) -> bool {
    let needle = fold(term);
    if needle.is_empty() {
        return true;
    }
    columns.into_iter().any(|c| fold(c).contains(&needle))
}

pub fn record_matches(view: &AssetRecordView, term: &str) -> bool {
    let r = &view.record;
    let id = r.asset_id.to_string();
    let version = r.version.to_string();
    let texts: Vec<String> = TrackedField::ALL
        .iter()
        .map(|f| r.fields.text_of(*f))
        .collect();
    let columns = [
        id.as_str(),
        version.as_str(),
        r.created_by.as_str(),
        r.updated_by.as_str(),
        view.created_by_name.as_str(),
        view.updated_by_name.as_str(),
    ];
    any_column_contains(
        columns.into_iter().chain(texts.iter().map(String::as_str)),
        term,
    )
}

pub fn history_matches(view: &HistoryView, term: &str) -> bool {
    let e = &view.entry;
    let asset_id = e.asset_id.to_string();
    let columns = [
        asset_id.as_str(),
        e.action.as_str(),
        e.field_label.as_deref().unwrap_or(""),
        e.old_value.as_str(),
        e.new_value.as_str(),
        e.changed_by.as_str(),
        view.changed_by_name.as_str(),
        view.asset_model.as_deref().unwrap_or(""),
    ];
    any_column_contains(columns, term)
}

pub fn filter_records(views: Vec<AssetRecordView>, term: Option<&str>) -> Vec<AssetRecordView> {
    match term {
        Some(t) => views.into_iter().filter(|v| record_matches(v, t)).collect(),
        None => views,
    }
}

pub fn filter_history(views: Vec<HistoryView>, term: Option<&str>) -> Vec<HistoryView> {
    match term {
        Some(t) => views.into_iter().filter(|v| history_matches(v, t)).collect(),
        None => views,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inventory_kernel_contracts::asset::{AssetFields, AssetId, AssetRecord};
    use inventory_kernel_contracts::principal::PrincipalId;
    use inventory_kernel_contracts::MonotonicTimeNs;

    fn view(id: u64, model: &str, location: &str, ip: Option<&str>) -> AssetRecordView {
        let fields = AssetFields::v1(
            model,
            location,
            None,
            None,
            ip.map(ToString::to_string),
            None,
            None,
            None,
            None,
        )
        .unwrap();
        AssetRecordView {
            record: AssetRecord::created_v1(
                AssetId(id),
                fields,
                PrincipalId::new("alice@example.com").unwrap(),
                MonotonicTimeNs(1),
            )
            .unwrap(),
            created_by_name: "Alice Admin".to_string(),
            updated_by_name: "Alice Admin".to_string(),
        }
    }

    #[test]
    fn at_search_01_matches_any_column_case_insensitively() {
        let rows = vec![
            view(1, "PowerEdge R730", "DC1", Some("10.0.0.5")),
            view(2, "ProLiant DL380", "DC2", None),
        ];
        let hits = filter_records(rows.clone(), Some("r730"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.asset_id, AssetId(1));

        assert_eq!(filter_records(rows.clone(), Some("10.0.0")).len(), 1);
        assert_eq!(filter_records(rows.clone(), Some("alice admin")).len(), 2);
        assert!(filter_records(rows, Some("nowhere")).is_empty());
    }

    #[test]
    fn at_search_02_blank_or_absent_term_returns_everything() {
        let rows = vec![view(1, "R730", "DC1", None), view(2, "DL380", "DC2", None)];
        assert_eq!(filter_records(rows.clone(), None).len(), 2);
        assert_eq!(filter_records(rows, Some("   ")).len(), 2);
    }
}
