//! done 负载编解码
//!
//! 结果树先序列化为 JSON，再用 zstd 压缩。结果中的二进制数据单独压缩后
//! 以 `{"$blob": "<base64>"}` 形式内联，使父结构保持类型一致。
//! 去环后的重复/循环引用以 `{"$ref": "<path>"}` 标记。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// 二进制块标记键
pub const BLOB_KEY: &str = "$blob";

/// 反向引用标记键
pub const REF_KEY: &str = "$ref";

/// zstd 压缩级别
const COMPRESSION_LEVEL: i32 = 3;

/// 编解码错误
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("压缩错误: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Base64 解码错误: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// 编码 done 负载
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    Ok(zstd::stream::encode_all(json.as_slice(), COMPRESSION_LEVEL)?)
}

/// 解码 done 负载
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let json = zstd::stream::decode_all(bytes)?;
    Ok(serde_json::from_slice(&json)?)
}

/// 压缩并内联二进制数据
pub fn inline_blob(bytes: &[u8]) -> Result<Value> {
    let compressed = zstd::stream::encode_all(bytes, COMPRESSION_LEVEL)?;
    Ok(json!({ BLOB_KEY: STANDARD.encode(compressed) }))
}

/// 还原内联的二进制数据，不是二进制块时返回 None
pub fn extract_blob(value: &Value) -> Option<Result<Vec<u8>>> {
    let encoded = tagged_str(value, BLOB_KEY)?;
    Some(
        STANDARD
            .decode(encoded)
            .map_err(CodecError::from)
            .and_then(|compressed| Ok(zstd::stream::decode_all(compressed.as_slice())?)),
    )
}

/// 创建反向引用标记
pub fn back_reference(path: &str) -> Value {
    json!({ REF_KEY: path })
}

/// 读取反向引用标记指向的路径
pub fn as_back_reference(value: &Value) -> Option<&str> {
    tagged_str(value, REF_KEY)
}

fn tagged_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get(key)?.as_str()
}

/// `Vec<u8>` 以 base64 字符串序列化
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
