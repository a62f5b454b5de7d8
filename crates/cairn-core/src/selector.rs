//! Annotation/label selector matching
//!
//! Selectors in cairn are plain key/value maps with subset semantics: every
//! pair must be present on the object, looked up in the union of its
//! annotations and labels. No expression language.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

/// Returns true when every `selector` pair is carried by the object, either
/// as an annotation or as a label. Annotations win when the same key exists
/// in both maps. An empty selector matches nothing.
pub fn matches_selector(selector: &BTreeMap<String, String>, obj: &DynamicObject) -> bool {
    if selector.is_empty() {
        return false;
    }

    let annotations = obj.metadata.annotations.as_ref();
    let labels = obj.metadata.labels.as_ref();

    selector.iter().all(|(key, want)| {
        let got = annotations
            .and_then(|a| a.get(key))
            .or_else(|| labels.and_then(|l| l.get(key)));
        got.map(|v| v == want).unwrap_or(false)
    })
}
