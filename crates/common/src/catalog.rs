//! Method catalogs: closed enums exchanged as a `(method, data)` pair.
//!
//! Catalog enums are declared adjacently tagged,
//! `#[serde(tag = "method", content = "data")]`, and get a single decode step
//! from a method name plus its JSON payload.

use serde::de::DeserializeOwned;
use serde::ser::Error as _;
use serde::Serialize;
use serde_json::{Map, Value};

/// A closed set of methods with typed payloads.
pub trait MethodCatalog: Serialize + DeserializeOwned {
    /// Decode a method name and payload into the matching variant.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown method or a payload that does not
    /// match the variant's schema.
    fn decode(method: &str, data: Value) -> Result<Self, serde_json::Error> {
        let mut tagged = Map::with_capacity(2);
        tagged.insert("method".to_string(), Value::String(method.to_string()));
        tagged.insert("data".to_string(), data);
        serde_json::from_value(Value::Object(tagged))
    }

    /// Split into a method name and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize or the type is not
    /// adjacently tagged.
    fn encode(&self) -> Result<(String, Value), serde_json::Error> {
        let Value::Object(mut map) = serde_json::to_value(self)? else {
            return Err(serde_json::Error::custom(
                "catalog entry must serialize to an object",
            ));
        };
        let Some(Value::String(method)) = map.remove("method") else {
            return Err(serde_json::Error::custom("catalog entry has no method tag"));
        };
        let data = map
            .remove("data")
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok((method, data))
    }
}
