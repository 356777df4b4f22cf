use super::*;
use axum::http::HeaderMap;

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

#[test]
fn valid_bearer_token() {
    let headers = headers_with("Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig");
    assert_eq!(
        extract_bearer_token(&headers).unwrap(),
        "eyJhbGciOiJIUzI1NiJ9.payload.sig"
    );
}

#[test]
fn valid_bearer_token_with_extra_whitespace() {
    let headers = headers_with("Bearer   abc.def.ghi  ");
    assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
}

#[test]
fn case_insensitive_bearer() {
    let headers = headers_with("bearer abc.def.ghi");
    assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
}

#[test]
fn missing_authorization_header() {
    let headers = HeaderMap::new();
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
}

#[test]
fn empty_authorization_header() {
    let headers = headers_with("");
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
}

#[test]
fn missing_bearer_prefix() {
    let headers = headers_with("abc.def.ghi");
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
}

#[test]
fn wrong_scheme() {
    let headers = headers_with("Basic dXNlcjpwYXNz");
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::InvalidFormat));
}

#[test]
fn bearer_without_token() {
    let headers = headers_with("Bearer    ");
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
}
