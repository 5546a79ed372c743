//! 脚本值与 JSON 之间的转换
//!
//! 脚本中的共享值 (闭包捕获的变量等) 可能形成重复或循环引用。
//! 转换时每个共享值只展开一次，再次遇到时输出 `{"$ref": "<首次出现的路径>"}`。

use rhai::{Array, Blob, Dynamic, Map};
use serde_json::{Number, Value};
use std::collections::HashMap;
use steprun_common::codec::{back_reference, inline_blob};

/// 将脚本值转换为 JSON
pub fn to_json(value: &Dynamic) -> Value {
    Walker::default().walk(value, "$")
}

/// 将 JSON 转换为脚本值
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value).unwrap_or(Dynamic::UNIT)
}

#[derive(Default)]
struct Walker {
    /// 共享值地址 -> 首次出现的路径
    seen: HashMap<usize, String>,
}

impl Walker {
    fn walk(&mut self, value: &Dynamic, path: &str) -> Value {
        if !value.is_shared() {
            return self.walk_plain(value, path);
        }

        let Some((address, inner)) = shared_target(value) else {
            return Value::Null;
        };
        if let Some(first) = self.seen.get(&address) {
            return back_reference(first);
        }
        self.seen.insert(address, path.to_string());
        self.walk_plain(&inner, path)
    }

    fn walk_plain(&mut self, value: &Dynamic, path: &str) -> Value {
        if value.is_unit() {
            return Value::Null;
        }
        if let Ok(b) = value.as_bool() {
            return Value::Bool(b);
        }
        if let Ok(i) = value.as_int() {
            return Value::Number(i.into());
        }
        if let Ok(f) = value.as_float() {
            return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
        }
        if let Ok(c) = value.as_char() {
            return Value::String(c.to_string());
        }
        if value.is_string() {
            return Value::String(value.clone().into_string().unwrap_or_default());
        }

        if let Some(items) = value.read_lock::<Array>().map(|array| array.clone()) {
            return Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.walk(item, &format!("{}[{}]", path, i)))
                    .collect(),
            );
        }

        if let Some(entries) = value.read_lock::<Map>().map(|map| map.clone()) {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (key, item) in entries.iter() {
                let child = self.walk(item, &format!("{}.{}", path, key));
                object.insert(key.to_string(), child);
            }
            return Value::Object(object);
        }

        if let Some(bytes) = value.read_lock::<Blob>().map(|blob| blob.clone()) {
            return inline_blob(&bytes).unwrap_or(Value::Null);
        }

        Value::String(value.type_name().to_string())
    }
}

/// 共享值的身份 (内部单元地址) 和当前内容
///
/// 读锁在返回前释放，遍历子值时不会重入同一把锁。
fn shared_target(value: &Dynamic) -> Option<(usize, Dynamic)> {
    let guard = value.read_lock::<Dynamic>()?;
    let address = &*guard as *const Dynamic as usize;
    Some((address, guard.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steprun_common::codec::{as_back_reference, extract_blob};

    #[test]
    fn test_plain_values() {
        let mut map = Map::new();
        map.insert("a".into(), Dynamic::from(1_i64));
        map.insert("b".into(), Dynamic::from("x"));
        map.insert("c".into(), Dynamic::from(vec![Dynamic::from(true), Dynamic::UNIT]));

        assert_eq!(
            to_json(&Dynamic::from_map(map)),
            json!({"a": 1, "b": "x", "c": [true, null]})
        );
    }

    #[test]
    fn test_circular_reference_becomes_marker() {
        let mut shared = Dynamic::from_map(Map::new()).into_shared();
        let me = shared.clone();
        if let Some(mut map) = shared.write_lock::<Map>() {
            map.insert("name".into(), Dynamic::from("root"));
            map.insert("self".into(), me);
        }

        let value = to_json(&shared);
        assert_eq!(value["name"], "root");
        assert_eq!(as_back_reference(&value["self"]), Some("$"));

        let text = serde_json::to_string(&value).unwrap();
        let decoded: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded["self"], json!({"$ref": "$"}));
    }

    #[test]
    fn test_repeated_reference() {
        let shared = Dynamic::from_map(Map::new()).into_shared();
        let list = Dynamic::from(vec![shared.clone(), shared]);
        let value = to_json(&list);
        assert_eq!(value[0], json!({}));
        assert_eq!(value[1], json!({"$ref": "$[0]"}));
    }

    #[test]
    fn test_blob_is_inlined() {
        let blob: Blob = vec![7u8; 32];
        let value = to_json(&Dynamic::from_blob(blob.clone()));
        assert_eq!(extract_blob(&value).unwrap().unwrap(), blob);
    }

    #[test]
    fn test_json_to_dynamic() {
        let value = json_to_dynamic(&json!({"n": 2, "list": [1, "a"]}));
        assert!(value.is_map());
        assert_eq!(to_json(&value), json!({"n": 2, "list": [1, "a"]}));
    }
}
