//! PayloadCodec - 型付き入力と task payload（JSON）の相互変換

use serde_json::Value;

use super::task::TypedTask;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {task_type} payload: {source}")]
    Encode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload does not match {task_type}: {source}")]
    Decode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: TypedTask>(input: &T) -> Result<Value, CodecError> {
        serde_json::to_value(input).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: TypedTask>(payload: &Value) -> Result<T, CodecError> {
        serde_json::from_value(payload.clone()).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::task::fixtures::PurgeCache;
    use serde_json::json;

    #[test]
    fn decode_fills_defaults_and_names_the_type_on_mismatch() {
        let input: PurgeCache = PayloadCodec::decode(&json!({ "prefix": "img/" })).unwrap();
        assert_eq!(input, PurgeCache { prefix: "img/".into(), dry_run: false });

        let err = PayloadCodec::decode::<PurgeCache>(&json!({ "prefix": 7 })).unwrap_err();
        assert!(err.to_string().starts_with("payload does not match test.cache.purge.v1"));
    }
}
