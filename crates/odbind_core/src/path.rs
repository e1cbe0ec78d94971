//! Property paths over nested records.
//!
//! A path is a sequence of `/`-delimited steps (`Customer/Address/City`).
//! A step prefixed with [`FAN_OUT_MARKER`] (`*Lines/Product/Name`) fans
//! out: the array found at that step is traversed element by element and
//! the remaining steps are applied to each element.

use crate::error::{CoreError, CoreResult};
use crate::value::{Record, Value};

/// Marks a step whose value is an array to fan out over.
pub const FAN_OUT_MARKER: char = '*';

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    name: String,
    fan_out: bool,
}

/// A parsed property path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath {
    raw: String,
    steps: Vec<Step>,
}

impl PropertyPath {
    /// Parses a path. Empty paths and empty steps are rejected.
    pub fn parse(path: &str) -> CoreResult<Self> {
        let steps = path
            .split('/')
            .map(|step| match step.strip_prefix(FAN_OUT_MARKER) {
                Some(name) => Step {
                    name: name.to_string(),
                    fan_out: true,
                },
                None => Step {
                    name: step.to_string(),
                    fan_out: false,
                },
            })
            .collect::<Vec<_>>();

        if let Some(empty) = steps.iter().find(|s| s.name.is_empty()) {
            return Err(CoreError::PathResolution {
                path: path.to_string(),
                step: empty.name.clone(),
            });
        }

        Ok(Self {
            raw: path.to_string(),
            steps,
        })
    }

    /// Returns the path as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if any step fans out.
    pub fn is_multiple(&self) -> bool {
        self.steps.iter().any(|s| s.fan_out)
    }

    /// Reads the value(s) at this path.
    ///
    /// Fan-out steps collect one result per array element into a
    /// [`Value::Array`]; elements missing the rest of the path contribute
    /// [`Value::Null`]. A missing step before any fan-out yields `None`.
    pub fn read(&self, record: &Record) -> Option<Value> {
        read_steps(record, &self.steps)
    }

    /// Reads the value(s) at this path starting from an arbitrary value.
    pub fn read_value(&self, value: &Value) -> Option<Value> {
        value.as_object().and_then(|record| self.read(record))
    }

    /// Replaces the value(s) at this path with `transform(old)`.
    ///
    /// An absent leaf is passed as [`Value::Null`]. When the last step fans
    /// out, the transform is applied to every element of the array.
    pub fn write<F>(&self, record: &mut Record, mut transform: F) -> CoreResult<()>
    where
        F: FnMut(Value) -> Value,
    {
        self.write_steps(record, &self.steps, &mut transform)
    }

    fn write_steps<F>(&self, record: &mut Record, steps: &[Step], transform: &mut F) -> CoreResult<()>
    where
        F: FnMut(Value) -> Value,
    {
        let Some((step, rest)) = steps.split_first() else {
            return Ok(());
        };

        if step.fan_out {
            let items = record
                .get_mut(&step.name)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| self.unresolved(step))?;
            for item in items.iter_mut() {
                if rest.is_empty() {
                    *item = transform(std::mem::take(item));
                } else {
                    let nested = item.as_object_mut().ok_or_else(|| self.unresolved(step))?;
                    self.write_steps(nested, rest, transform)?;
                }
            }
            return Ok(());
        }

        if rest.is_empty() {
            let old = record.remove(&step.name).unwrap_or_default();
            record.insert(step.name.clone(), transform(old));
            return Ok(());
        }

        let nested = record
            .get_mut(&step.name)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| self.unresolved(step))?;
        self.write_steps(nested, rest, transform)
    }

    fn unresolved(&self, step: &Step) -> CoreError {
        CoreError::PathResolution {
            path: self.raw.clone(),
            step: step.name.clone(),
        }
    }
}

fn read_steps(record: &Record, steps: &[Step]) -> Option<Value> {
    let (step, rest) = steps.split_first()?;
    let next = record.get(&step.name)?;

    if step.fan_out {
        let items = next.as_array()?;
        if rest.is_empty() {
            return Some(next.clone());
        }
        let collected = items
            .iter()
            .map(|item| {
                item.as_object()
                    .and_then(|nested| read_steps(nested, rest))
                    .unwrap_or(Value::Null)
            })
            .collect();
        return Some(Value::Array(collected));
    }

    if rest.is_empty() {
        Some(next.clone())
    } else {
        read_steps(next.as_object()?, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(json: serde_json::Value) -> Record {
        Value::from(json).into_object().unwrap()
    }

    fn order() -> Record {
        record(json!({
            "OrderID": 1,
            "Customer": {"Name": "Ada", "Address": {"City": "Lyon"}},
            "Lines": [
                {"Qty": 2, "Product": {"Name": "Pen"}},
                {"Qty": 5},
                {"Qty": 1, "Product": {"Name": "Ink"}}
            ]
        }))
    }

    #[test]
    fn parse_rejects_empty_steps() {
        assert!(PropertyPath::parse("").is_err());
        assert!(PropertyPath::parse("a//b").is_err());
        assert!(PropertyPath::parse("*").is_err());
        assert!(PropertyPath::parse("*Lines/Qty").unwrap().is_multiple());
        assert!(!PropertyPath::parse("Customer/Name").unwrap().is_multiple());
    }

    #[test]
    fn read_plain_path() {
        let path = PropertyPath::parse("Customer/Address/City").unwrap();
        assert_eq!(path.read(&order()), Some(Value::from("Lyon")));

        let missing = PropertyPath::parse("Customer/Phone/Number").unwrap();
        assert_eq!(missing.read(&order()), None);
    }

    #[test]
    fn read_fan_out_collects_per_element() {
        let path = PropertyPath::parse("*Lines/Product/Name").unwrap();
        assert_eq!(
            path.read(&order()),
            Some(Value::from(json!(["Pen", null, "Ink"])))
        );

        let whole = PropertyPath::parse("*Lines").unwrap();
        assert_eq!(whole.read(&order()).unwrap().as_array().unwrap().len(), 3);

        let not_array = PropertyPath::parse("*Customer/Name").unwrap();
        assert_eq!(not_array.read(&order()), None);
    }

    #[test]
    fn write_plain_path() {
        let mut data = order();
        let path = PropertyPath::parse("Customer/Name").unwrap();
        path.write(&mut data, |v| Value::from(format!("{}!", v.as_str().unwrap())))
            .unwrap();
        assert_eq!(path.read(&data), Some(Value::from("Ada!")));

        let leaf = PropertyPath::parse("Customer/Phone").unwrap();
        leaf.write(&mut data, |v| {
            assert!(v.is_null());
            Value::from("555")
        })
        .unwrap();
        assert_eq!(leaf.read(&data), Some(Value::from("555")));
    }

    #[test]
    fn write_fan_out() {
        let mut data = order();
        let qty = PropertyPath::parse("*Lines/Qty").unwrap();
        qty.write(&mut data, |v| Value::from(v.as_i64().unwrap() * 10))
            .unwrap();
        assert_eq!(qty.read(&data), Some(Value::from(json!([20, 50, 10]))));

        let mut tags = record(json!({"Tags": ["a", "b"]}));
        PropertyPath::parse("*Tags")
            .unwrap()
            .write(&mut tags, |v| Value::from(v.as_str().unwrap().to_uppercase()))
            .unwrap();
        assert_eq!(tags["Tags"], Value::from(json!(["A", "B"])));
    }

    #[test]
    fn write_missing_intermediate_fails() {
        let mut data = order();
        let path = PropertyPath::parse("Supplier/Name").unwrap();
        let err = path.write(&mut data, |v| v).unwrap_err();
        assert!(matches!(err, CoreError::PathResolution { ref step, .. } if step == "Supplier"));

        let fan = PropertyPath::parse("*Customer/Name").unwrap();
        assert!(fan.write(&mut data, |v| v).is_err());

        // Second line has no Product
        let nested = PropertyPath::parse("*Lines/Product/Name").unwrap();
        assert!(nested.write(&mut data, |v| v).is_err());
    }
}
