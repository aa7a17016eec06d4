// queryforge-core/src/stage/expression/build.rs
// Native rendering of pipeline expressions

use super::{Accumulator, PipelineExpression, PipelineOp as Op};
use crate::error::Result;
use crate::stage::StageKind;
use crate::tree::{Built, ComponentId, RValue, ValueId, ROOT};
use serde_json::{json, Map, Value};

/// Read a localized property from the document's locale side table
pub(crate) fn localized_value(path: &str, locale: &str) -> Value {
    json!({
        "$let": {
            "vars": {
                "localize": {
                    "$arrayElemAt": [
                        {
                            "$filter": {
                                "input": format!("$locales.{}", path),
                                "as": "loc",
                                "cond": { "$eq": ["$$loc.locale", locale] }
                            }
                        },
                        0
                    ]
                }
            },
            "in": { "$concat": ["$$localize.value", ""] }
        }
    })
}

fn date_to_string(arg: Value) -> Value {
    match arg {
        Value::Array(items) => {
            let mut fields = Map::new();
            let mut items = items.into_iter();
            fields.insert("format".to_string(), items.next().unwrap_or(Value::Null));
            fields.insert("date".to_string(), items.next().unwrap_or(Value::Null));
            if let Some(timezone) = items.next() {
                fields.insert("timezone".to_string(), timezone);
            }
            Value::Object(fields)
        }
        other => other,
    }
}

impl<'a, 'c, 's> PipelineExpression<'a, 'c, 's> {
    /// Render the stage body. Runs after `generate`, which records the
    /// localized reads and counted arrays used here.
    pub fn build(&self) -> Result<Map<String, Value>> {
        let root = self.value_id(ROOT)?;
        match self.build_value(root)?.into_value() {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    fn build_value(&self, v: ValueId) -> Result<Built> {
        let built = match self.tree.rvalue(v) {
            RValue::Variable(name) => Value::String(format!("{{{{{}}}}}", name)),
            RValue::Simple(value) | RValue::Raw(value) => value.clone(),
            RValue::Property(path) => self.build_property(v, path),
            RValue::Array(elements) => Value::Array(
                elements
                    .iter()
                    .map(|e| self.build_value(*e).map(Built::into_value))
                    .collect::<Result<Vec<_>>>()?,
            ),
            RValue::Expression(children) => {
                let mut map = Map::new();
                for child in children {
                    match self.build_component(*child)? {
                        Built::Replace(inner) => return Ok(*inner),
                        Built::Value(Value::Object(object)) => map.extend(object),
                        Built::Value(_) => {}
                    }
                }
                Value::Object(map)
            }
        };
        Ok(Built::Value(built))
    }

    fn build_property(&self, v: ValueId, path: &str) -> Value {
        match self.localized.borrow().get(&v) {
            Some(locale) => localized_value(path, locale),
            None => Value::String(format!("${}", path)),
        }
    }

    fn build_component(&self, c: ComponentId) -> Result<Built> {
        if self.tree.is_operator(c) {
            return self.build_operator(c);
        }
        let key = self.tree.key(c).to_string();
        let v = self.value_id(c)?;
        if let RValue::Simple(value) = self.tree.rvalue(v) {
            if self.kind() != StageKind::Group {
                return Ok(Built::Value(json!({ key: self.build_inclusion(c, v, value) })));
            }
        }
        match self.build_value(v)? {
            Built::Replace(inner) => Ok(*inner),
            Built::Value(value) => Ok(Built::Value(json!({ key: value }))),
        }
    }

    /// `field: 1`
    fn build_inclusion(&self, c: ComponentId, v: ValueId, value: &Value) -> Value {
        let path = &self.tree.component(c).property_fullpath;
        if let Some(locale) = self.localized.borrow().get(&v) {
            return localized_value(path, locale);
        }
        match self.kind() {
            StageKind::AddFields => Value::String(format!("${}", path)),
            _ => value.clone(),
        }
    }

    fn build_operator(&self, c: ComponentId) -> Result<Built> {
        let v = self.value_id(c)?;
        let arg = self.build_value(v)?.into_value();
        if let Some(accumulator) = self.accumulator(c) {
            return Ok(Built::Value(self.build_accumulator(c, accumulator, arg)));
        }
        let op = self.pipeline_op(c)?;
        let key = op.key();
        let built = match op {
            Op::String | Op::Number | Op::Integer | Op::Boolean | Op::Date | Op::ObjectId | Op::Array
            | Op::Object => Built::replace(json!({ "$literal": arg })),
            Op::DateToString => Built::Value(json!({ key: date_to_string(arg) })),
            Op::Expand => {
                let field = self.tree.parent_component(c).unwrap_or(ROOT);
                let field_key = self.tree.key(field).to_string();
                let included = match self.kind() {
                    StageKind::AddFields => {
                        Value::String(format!("${}", self.tree.component(field).property_fullpath))
                    }
                    _ => json!(1),
                };
                Built::Replace(Box::new(Built::replace(json!({ field_key: included }))))
            }
            _ if op.is_date_part() => Built::replace(json!({
                "$cond": [{ "$ifNull": [arg.clone(), false] }, { key: arg }, null]
            })),
            _ => Built::Value(json!({ key: arg })),
        };
        Ok(built)
    }

    fn build_accumulator(&self, c: ComponentId, accumulator: Accumulator, arg: Value) -> Value {
        match accumulator {
            Accumulator::Count => {
                if self.counted_arrays.borrow().contains(&c) {
                    json!({ "$sum": { "$cond": [{ "$isArray": arg.clone() }, { "$size": arg }, 0] } })
                } else {
                    json!({ "$sum": { "$cond": [{ "$ifNull": [arg, false] }, 1, 0] } })
                }
            }
            Accumulator::PushAll => json!({ "$push": { "$ifNull": [arg, false] } }),
            other => {
                let key = other.key();
                json!({ key: arg })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localized_value_reads_locale_table() {
        let value = localized_value("c_title", "fr_CA");
        assert_eq!(
            value["$let"]["vars"]["localize"]["$arrayElemAt"][0]["$filter"]["input"],
            json!("$locales.c_title")
        );
        assert_eq!(
            value["$let"]["vars"]["localize"]["$arrayElemAt"][0]["$filter"]["cond"],
            json!({"$eq": ["$$loc.locale", "fr_CA"]})
        );
        assert_eq!(value["$let"]["in"], json!({"$concat": ["$$localize.value", ""]}));
    }

    #[test]
    fn test_date_to_string_fields() {
        assert_eq!(
            date_to_string(json!(["%Y", "$c_born"])),
            json!({"format": "%Y", "date": "$c_born"})
        );
        assert_eq!(
            date_to_string(json!(["%Y", "$c_born", "UTC"])),
            json!({"format": "%Y", "date": "$c_born", "timezone": "UTC"})
        );
    }
}
