use courier_core::store::CatalogRepository;
use courier_core::{EventBinding, NotificationTemplate, Result};
use serde_json::{Map, Value};

use crate::render::scalar_string;

/// Active bindings for `(event_type, event_action)` whose trigger conditions
/// hold for `event_data`, in binding insertion order.
pub async fn find_bindings(
    catalog: &dyn CatalogRepository,
    event_type: &str,
    event_action: &str,
    event_data: &Value,
) -> Result<Vec<(EventBinding, NotificationTemplate)>> {
    let candidates = catalog.active_bindings(event_type, event_action).await?;
    let total = candidates.len();

    let matched: Vec<_> = candidates
        .into_iter()
        .filter(|(binding, _)| conditions_match(&binding.trigger_conditions, event_data))
        .collect();

    tracing::debug!(
        "Event {}.{}: {} of {} bindings matched",
        event_type,
        event_action,
        matched.len(),
        total
    );
    Ok(matched)
}

/// Every condition key must be present in `event_data` and loosely equal.
pub fn conditions_match(conditions: &Map<String, Value>, event_data: &Value) -> bool {
    conditions.iter().all(|(field, expected)| {
        event_data
            .get(field)
            .is_some_and(|actual| loose_eq(actual, expected))
    })
}

/// Equality across JSON scalar types: `7 == "7"`, `1.0 == 1`, `true == "true"`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (scalar_string(a), scalar_string(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}
