//! HTTP side of the still-image server
//!
//! hyper parses requests and frames responses. This module decides whether a request
//! may stream and builds the headers and multipart parts sent back.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::HttpError;

/// Last non-empty segment of `path`
pub fn last_path_segment(path: &str) -> Option<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).last()
}

/// Accept only `GET` requests whose last decoded path segment equals `path`
///
/// The query string is ignored.
pub fn check_request(method: &Method, uri: &Uri, path: &str) -> Result<(), HttpError> {
    if *method != Method::GET {
        return Err(HttpError::UnsupportedMethod(method.to_string()));
    }

    let decoded = urlencoding::decode(uri.path())
        .map_err(|_| HttpError::MalformedPath(uri.path().to_string()))?;
    match last_path_segment(&decoded) {
        Some(segment) if segment == path => Ok(()),
        _ => Err(HttpError::UnknownPath(decoded.into_owned())),
    }
}

/// Headers of a successful multipart stream
///
/// Built once per server start; fails when the server name or boundary cannot be
/// carried in a header.
pub fn stream_headers(server_name: &str, boundary: &str) -> Result<HeaderMap, HttpError> {
    let server = HeaderValue::from_str(server_name)
        .map_err(|_| HttpError::InvalidHeader("server"))?;
    let content_type =
        HeaderValue::from_str(&format!("multipart/x-mixed-replace; boundary={boundary}"))
            .map_err(|_| HttpError::InvalidHeader("content-type"))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::SERVER, server);
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert("max-age", HeaderValue::from_static("0"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(
            "no-store, no-cache, must-revalidate, pre-check=0, post-check=0, max-age=0",
        ),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::CONTENT_TYPE, content_type);
    Ok(headers)
}

/// `200` response streaming `body` under `headers`
pub fn stream_response(headers: &HeaderMap, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.headers_mut() = headers.clone();
    response
}

/// Empty error response; the connection is closed after it
pub fn error_response(status: StatusCode, server_name: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    if let Ok(server) = HeaderValue::from_str(server_name) {
        headers.insert(header::SERVER, server);
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

/// One multipart part carrying `data`
pub fn part(boundary: &str, content_type: &str, data: &[u8]) -> Bytes {
    let head = format!(
        "--{boundary}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        data.len()
    );

    let mut buf = BytesMut::with_capacity(head.len() + data.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_check_request_matches_last_segment() {
        assert!(check_request(&Method::GET, &uri("/abc"), "abc").is_ok());
        assert!(check_request(&Method::GET, &uri("/mjpeg/abc/"), "abc").is_ok());
        let encoded = uri("/live/stream%20one?fps=10");
        assert!(check_request(&Method::GET, &encoded, "stream one").is_ok());

        assert_eq!(
            check_request(&Method::GET, &uri("/mjpeg/abc/other"), "abc"),
            Err(HttpError::UnknownPath("/mjpeg/abc/other".into()))
        );
        assert!(check_request(&Method::GET, &uri("/"), "abc").is_err());
    }

    #[test]
    fn test_check_request_rejects_other_methods() {
        assert_eq!(
            check_request(&Method::POST, &uri("/abc"), "abc"),
            Err(HttpError::UnsupportedMethod("POST".into()))
        );
        assert!(check_request(&Method::HEAD, &uri("/abc"), "abc").is_err());
    }

    #[test]
    fn test_check_request_rejects_invalid_encoding() {
        assert_eq!(
            check_request(&Method::GET, &uri("/%FF%FE"), "abc"),
            Err(HttpError::MalformedPath("/%FF%FE".into()))
        );
    }

    #[test]
    fn test_stream_headers() {
        let headers = stream_headers("cam", "frame-boundary").unwrap();

        assert_eq!(headers[header::SERVER], "cam");
        assert_eq!(headers[header::PRAGMA], "no-cache");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame-boundary"
        );
        assert!(headers[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .starts_with("no-store"));
    }

    #[test]
    fn test_stream_headers_reject_invalid_values() {
        assert_eq!(
            stream_headers("cam", "bad\r\nboundary"),
            Err(HttpError::InvalidHeader("content-type"))
        );
        assert_eq!(
            stream_headers("cam\n", "b"),
            Err(HttpError::InvalidHeader("server"))
        );
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "cam");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::CONNECTION], "close");
        assert_eq!(response.headers()[header::SERVER], "cam");
    }

    #[test]
    fn test_part_layout() {
        let part = part("b", "image/jpeg", &[1, 2, 3]);

        assert_eq!(
            &part[..],
            b"--b\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n\x01\x02\x03\r\n"
        );
    }
}
