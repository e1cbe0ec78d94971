//! Benchmark utilities.

use odbind_core::{EntityDefinition, Record, Value};
use serde_json::json;
use std::sync::Arc;

/// Definition with one level of children.
pub fn bench_definition() -> Arc<EntityDefinition> {
    EntityDefinition::new("Orders", "OrderID")
        .with_date_keys(["OrderDate"])
        .with_child(
            EntityDefinition::new("OrderLines", "LineID")
                .with_navigation_key("Lines")
                .with_foreign_key("OrderID"),
        )
        .shared()
}

/// Order snapshot with `lines` child records.
pub fn order_snapshot(id: i64, lines: usize) -> Record {
    let lines = (0..lines as i64)
        .map(|i| json!({"LineID": id * 10_000 + i, "Qty": i % 7, "Sku": format!("SKU-{i}")}))
        .collect::<Vec<_>>();
    let data = json!({
        "@odata.context": "$metadata#Orders/$entity",
        "OrderID": id,
        "Name": format!("Order {id}"),
        "OrderDate": "2024-05-01T10:00:00Z",
        "Lines": lines,
    });
    Value::from(data).into_object().unwrap_or_default()
}
