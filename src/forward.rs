//! Conversion between the HTTP terminator and the wire records.
//!
//! The terminator hands over each decrypted request as plain parts; the
//! backend's [`ResponseRecord`] is turned back into an `http::Response`.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, StatusCode};

use crate::protocol::{HeaderField, HttpPayload, RequestRecord, ResponseRecord};

/// Header that may appear only once in a response.
const STRICT_TRANSPORT_SECURITY: &str = "strict-transport-security";

impl RequestRecord {
    /// Build a record from an intercepted request.
    ///
    /// The uri is always `https://{host}{path_and_query}`. Headers with the
    /// same name (ignoring case) are grouped into one field, keeping the
    /// first spelling and the order of values.
    pub fn from_intercepted<'a, I>(
        method: &str,
        host: &str,
        path_and_query: &str,
        headers: I,
        body: impl Into<Bytes>,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut fields: Vec<HeaderField> = Vec::new();
        for (name, value) in headers {
            match fields
                .iter_mut()
                .find(|field| field.name.eq_ignore_ascii_case(name))
            {
                Some(field) => field.values.push(value.to_string()),
                None => fields.push(HeaderField::single(name, value)),
            }
        }

        let uri = format!("https://{}{}", host, path_and_query);
        tracing::info!("Forwarding {} {}", method, uri);
        RequestRecord::new(method, uri, HttpPayload::new(fields, body))
    }

    /// Build a record from an `http::Request`.
    ///
    /// The host comes from the request uri, or the `Host` header for
    /// origin-form requests.
    pub fn from_http(request: http::Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();

        let host = parts
            .uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(HOST)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .unwrap_or_default();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let values: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self::from_intercepted(
            parts.method.as_str(),
            &host,
            path_and_query,
            values.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            body,
        )
    }
}

impl ResponseRecord {
    /// Turn the backend's answer into a response for the client.
    ///
    /// - `Content-Type` values are joined with `,`.
    /// - `Content-Length` is kept only when the joined value is a number.
    /// - `Strict-Transport-Security` keeps its first value.
    /// - Every other header keeps every value.
    ///
    /// Headers that are not valid HTTP are dropped with a warning. A status
    /// outside 100..=999 becomes 500.
    pub fn into_http(self) -> http::Response<Bytes> {
        let status = u16::try_from(self.status_code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or_else(|| {
                tracing::warn!("Invalid status {} from backend, using 500", self.status_code);
                StatusCode::INTERNAL_SERVER_ERROR
            });
        tracing::info!("Status of response: {}", status.as_u16());

        let headers = response_headers(&self.payload.headers);
        let mut response = http::Response::new(self.payload.body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn response_headers(fields: &[HeaderField]) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for field in fields {
        let name = match HeaderName::from_bytes(field.name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                tracing::warn!("Skipping invalid header name {:?}", field.name);
                continue;
            }
        };

        if name == CONTENT_TYPE {
            insert_value(&mut headers, name, &field.values.join(","));
        } else if name == CONTENT_LENGTH {
            let joined = field.values.join(",");
            match joined.trim().parse::<u64>() {
                Ok(length) => insert_value(&mut headers, name, &length.to_string()),
                Err(_) => tracing::warn!("Dropping invalid Content-Length {:?}", joined),
            }
        } else if name.as_str() == STRICT_TRANSPORT_SECURITY {
            if let Some(first) = field.values.first() {
                insert_value(&mut headers, name, first);
            }
        } else {
            for value in &field.values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.append(name.clone(), value);
                    }
                    Err(_) => tracing::warn!("Skipping invalid value for header {}", name),
                }
            }
        }
    }

    headers
}

fn insert_value(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::warn!("Skipping invalid value for header {}", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(headers: Vec<HeaderField>) -> ResponseRecord {
        ResponseRecord::new(200, HttpPayload::new(headers, "ok"))
    }

    #[test]
    fn test_from_intercepted_builds_https_uri() {
        let record = RequestRecord::from_intercepted(
            "GET",
            "public-ubiservices.ubi.com",
            "/v1/profiles?id=1",
            Vec::<(&str, &str)>::new(),
            Bytes::new(),
        );
        assert_eq!(record.uri, "https://public-ubiservices.ubi.com/v1/profiles?id=1");
        assert_eq!(record.method, "GET");
        assert!(record.payload.headers.is_empty());
    }

    #[test]
    fn test_from_intercepted_groups_headers() {
        let record = RequestRecord::from_intercepted(
            "POST",
            "x",
            "/",
            [("Accept", "a"), ("Cookie", "c=1"), ("accept", "b")],
            "body",
        );
        assert_eq!(
            record.payload.headers,
            vec![
                HeaderField::new("Accept", vec!["a".into(), "b".into()]),
                HeaderField::single("Cookie", "c=1"),
            ]
        );
        assert_eq!(&record.payload.body[..], b"body");
    }

    #[test]
    fn test_from_http() {
        let request = http::Request::builder()
            .method("PUT")
            .uri("/items/3?x=y")
            .header("Host", "example.com")
            .header("X-A", "1")
            .header("X-A", "2")
            .body(Bytes::from_static(b"{}"))
            .unwrap();

        let record = RequestRecord::from_http(request);
        assert_eq!(record.method, "PUT");
        assert_eq!(record.uri, "https://example.com/items/3?x=y");
        assert_eq!(record.payload.header("x-a").unwrap(), ["1", "2"]);
        assert_eq!(&record.payload.body[..], b"{}");
    }

    #[test]
    fn test_into_http_content_headers() {
        let http = response(vec![
            HeaderField::new("Content-Type", vec!["text/plain".into(), "charset=utf-8".into()]),
            HeaderField::single("Content-Length", "2"),
        ])
        .into_http();

        assert_eq!(http.status(), StatusCode::OK);
        assert_eq!(http.headers()[CONTENT_TYPE], "text/plain,charset=utf-8");
        assert_eq!(http.headers()[CONTENT_LENGTH], "2");
        assert_eq!(&http.body()[..], b"ok");
    }

    #[test]
    fn test_into_http_drops_bad_content_length() {
        let http = response(vec![HeaderField::single("Content-Length", "lots")]).into_http();
        assert!(http.headers().get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_into_http_hsts_keeps_first() {
        let http = response(vec![HeaderField::new(
            "Strict-Transport-Security",
            vec!["max-age=1".into(), "max-age=2".into()],
        )])
        .into_http();

        let values: Vec<_> = http
            .headers()
            .get_all(STRICT_TRANSPORT_SECURITY)
            .iter()
            .collect();
        assert_eq!(values, ["max-age=1"]);
    }

    #[test]
    fn test_into_http_keeps_repeated_values() {
        let http = response(vec![HeaderField::new(
            "Set-Cookie",
            vec!["a=1".into(), "b=2".into()],
        )])
        .into_http();
        assert_eq!(http.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_into_http_skips_invalid_headers() {
        let http = response(vec![
            HeaderField::single("Bad Name", "x"),
            HeaderField::single("X-Ok", "fine"),
            HeaderField::single("X-Bad", "line\nbreak"),
        ])
        .into_http();
        assert_eq!(http.headers().len(), 1);
        assert_eq!(http.headers()["x-ok"], "fine");
    }

    #[test]
    fn test_into_http_invalid_status() {
        let http = ResponseRecord::new(-1, HttpPayload::default()).into_http();
        assert_eq!(http.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let http = ResponseRecord::internal_error().into_http();
        assert_eq!(http.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(http.headers().is_empty());
        assert!(http.body().is_empty());
    }
}
