//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records, order payloads and local
//! edit scripts against the fixture schema.

use odbind_core::{Record, Value};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-zA-Z]{0,11}").expect("Invalid regex")
}

/// Strategy for generating scalar values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

/// Strategy for generating flat records of scalar values.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    prop::collection::btree_map(field_name_strategy(), scalar_value_strategy(), 0..8)
}

/// Strategy for generating order payloads with up to five lines.
///
/// Line keys are unique within the order.
pub fn order_payload_strategy(order_id: i64) -> impl Strategy<Value = JsonValue> {
    (
        "[a-zA-Z ]{1,12}",
        prop::collection::vec(1..100i64, 0..5),
    )
        .prop_map(move |(name, quantities)| {
            let lines = quantities
                .into_iter()
                .enumerate()
                .map(|(i, qty)| json!({"LineID": order_id * 10 + i as i64, "Qty": qty}))
                .collect::<Vec<_>>();
            json!({"OrderID": order_id, "Name": name, "Lines": lines})
        })
}

/// A local edit of an order tree.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderEdit {
    /// Sets the order name.
    Rename(String),
    /// Sets the quantity of the line at `index` (modulo the line count).
    SetQty {
        /// Line position.
        index: usize,
        /// New quantity.
        qty: i64,
    },
    /// Removes the line at `index` (modulo the line count).
    RemoveLine(usize),
    /// Adds a line with a quantity.
    AddLine(i64),
}

/// Strategy for generating one edit.
pub fn order_edit_strategy() -> impl Strategy<Value = OrderEdit> {
    prop_oneof![
        "[a-zA-Z ]{1,12}".prop_map(OrderEdit::Rename),
        (any::<usize>(), 1..100i64).prop_map(|(index, qty)| OrderEdit::SetQty { index, qty }),
        any::<usize>().prop_map(OrderEdit::RemoveLine),
        (1..100i64).prop_map(OrderEdit::AddLine),
    ]
}

/// Strategy for generating edit scripts.
pub fn order_edits_strategy(max_len: usize) -> impl Strategy<Value = Vec<OrderEdit>> {
    prop::collection::vec(order_edit_strategy(), 0..max_len)
}
