// Storage encoding goes through bincode 2, wire encoding through serde_json
use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};

/// Serialize data using bincode 2.0 with standard configuration
pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| LedgerError::Serialization(format!("Serialization failed: {e}")))
}

/// Deserialize data using bincode 2.0 with standard configuration
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let config = bincode::config::standard();
    let (data, _) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| LedgerError::Serialization(format!("Deserialization failed: {e}")))?;
    Ok(data)
}

/// Compact JSON with sorted object keys. `serde_json::Value` keeps its maps in
/// a BTreeMap, so routing through it orders every nested object.
pub fn canonical_json<T: Serialize>(data: &T) -> Result<String> {
    let value = serde_json::to_value(data)?;
    Ok(serde_json::to_string(&value)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

fn parse_number<E: serde::de::Error>(value: NumberOrText) -> std::result::Result<Option<u64>, E> {
    match value {
        NumberOrText::Number(n) => Ok(Some(n)),
        NumberOrText::Text(text) => {
            let text = text.trim();
            if text.is_empty() || text == "None" || text == "null" {
                return Ok(None);
            }
            text.parse::<u64>()
                .map(Some)
                .map_err(|_| E::custom(format!("expected an unsigned integer, got {text:?}")))
        }
    }
}

/// Unsigned integers written as JSON strings; numbers are accepted on input.
pub mod stringified {
    use super::{parse_number, NumberOrText};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = NumberOrText::deserialize(deserializer)?;
        parse_number(raw)?.ok_or_else(|| serde::de::Error::custom("missing integer"))
    }
}

/// Optional ids: numbers, numeric strings, `"None"` and null are all accepted.
pub mod lenient_id {
    use super::{parse_number, NumberOrText};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        match Option::<NumberOrText>::deserialize(deserializer)? {
            Some(raw) => parse_number(raw),
            None => Ok(None),
        }
    }
}
