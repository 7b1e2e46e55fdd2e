use anyhow::{Context, Result};
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A whole upstream response frozen into a cache entry. Header names are
/// lowercased; value order within a name is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedResponse {
    pub status: u16,
    pub header: IndexMap<String, Vec<String>>,
    pub body: Bytes,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    body: String,
    status: u16,
    header: IndexMap<String, Vec<String>>,
}

impl SerializedResponse {
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut header: IndexMap<String, Vec<String>> = IndexMap::new();
        for name in headers.keys() {
            let values = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok().map(|v| v.to_string()))
                .collect();
            header.insert(name.as_str().to_string(), values);
        }
        Self {
            status: status.as_u16(),
            header,
            body,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub fn encode(resp: &SerializedResponse) -> Result<Bytes> {
    let wire = WireResponse {
        body: base64::engine::general_purpose::STANDARD.encode(&resp.body),
        status: resp.status,
        header: resp.header.clone(),
    };
    let data = serde_json::to_vec(&wire).context("encode cached response")?;
    Ok(Bytes::from(data))
}

pub fn decode(data: &[u8]) -> Result<SerializedResponse> {
    let wire: WireResponse = serde_json::from_slice(data).context("decode cached response")?;
    let body = base64::engine::general_purpose::STANDARD
        .decode(&wire.body)
        .context("decode cached body")?;
    Ok(SerializedResponse {
        status: wire.status,
        header: wire.header,
        body: Bytes::from(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut header = IndexMap::new();
        header.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        header.insert(
            "set-cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        );
        let resp = SerializedResponse {
            status: 203,
            header,
            body: Bytes::from_static(b"\x00\x01binary\xffbody"),
        };

        let encoded = encode(&resp).expect("encode");
        let decoded = decode(&encoded).expect("decode");
        assert_eq!(decoded, resp);
    }

    #[test]
    fn round_trip_empty_body() {
        let resp = SerializedResponse {
            status: 404,
            header: IndexMap::new(),
            body: Bytes::new(),
        };
        let decoded = decode(&encode(&resp).expect("encode")).expect("decode");
        assert_eq!(decoded, resp);
    }

    #[test]
    fn from_parts_preserves_value_order() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "first=1".parse().unwrap());
        headers.append("Set-Cookie", "second=2".parse().unwrap());
        headers.insert("Content-Type", "application/json".parse().unwrap());

        let resp = SerializedResponse::from_parts(StatusCode::OK, &headers, Bytes::new());
        assert_eq!(
            resp.header.get("set-cookie").unwrap(),
            &vec!["first=1".to_string(), "second=2".to_string()]
        );
        assert_eq!(
            resp.header.get("content-type").unwrap(),
            &vec!["application/json".to_string()]
        );
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(decode(b"not json").is_err());
    }
}
