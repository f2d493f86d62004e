//! Minimal HTTP/1.1 request-line and header parsing for the two verbs the
//! image transport accepts (§4.D).

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed HTTP request")]
    Malformed,
    #[error("incomplete request, need more bytes")]
    Incomplete,
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("missing or invalid header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid Range header")]
    InvalidRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRequest {
    Put {
        path: String,
        content_length: u64,
    },
    Get {
        path: String,
        pool: Uuid,
        domain: Uuid,
        image: Uuid,
        range_end: u64,
    },
}

/// Parses the request line and headers out of `buf`. Returns the request
/// plus how many bytes of `buf` the header block consumed (the body, if
/// any, starts right after).
pub fn parse_request(buf: &[u8]) -> Result<(ImageRequest, usize), RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).map_err(|_| RequestError::Malformed)?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(RequestError::Incomplete),
    };

    let method = req.method.ok_or(RequestError::Malformed)?;
    let path = req.path.ok_or(RequestError::Malformed)?.to_string();

    let header_value = |name: &str| -> Option<String> {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::to_string)
    };

    match method {
        "PUT" => {
            let content_length = header_value("content-length")
                .ok_or(RequestError::MissingHeader("content-length"))?
                .parse::<u64>()
                .map_err(|_| RequestError::MissingHeader("content-length"))?;
            Ok((
                ImageRequest::Put {
                    path,
                    content_length,
                },
                consumed,
            ))
        }
        "GET" => {
            let pool = parse_uuid_header(&header_value, "pool-id")?;
            let domain = parse_uuid_header(&header_value, "domain-id")?;
            let image = parse_uuid_header(&header_value, "image-id")?;
            let range = header_value("range").ok_or(RequestError::MissingHeader("range"))?;
            let range_end = parse_range_end(&range)?;
            Ok((
                ImageRequest::Get {
                    path,
                    pool,
                    domain,
                    image,
                    range_end,
                },
                consumed,
            ))
        }
        other => Err(RequestError::UnsupportedMethod(other.to_string())),
    }
}

fn parse_uuid_header(
    header_value: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Uuid, RequestError> {
    header_value(name)
        .and_then(|v| Uuid::parse_str(&v).ok())
        .ok_or(RequestError::MissingHeader(name))
}

/// `bytes=0-N` -> `N`. Only the single-range, zero-start form the spec
/// requires is accepted (§4.D).
fn parse_range_end(range: &str) -> Result<u64, RequestError> {
    let spec = range.strip_prefix("bytes=").ok_or(RequestError::InvalidRange)?;
    let (start, end) = spec.split_once('-').ok_or(RequestError::InvalidRange)?;
    if start != "0" {
        return Err(RequestError::InvalidRange);
    }
    end.parse::<u64>().map_err(|_| RequestError::InvalidRange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_with_content_length() {
        let raw = b"PUT /images/foo HTTP/1.1\r\ncontent-length:1024\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(
            req,
            ImageRequest::Put {
                path: "/images/foo".to_string(),
                content_length: 1024,
            }
        );
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parses_get_with_range_and_uuids() {
        let pool = Uuid::new_v4();
        let domain = Uuid::new_v4();
        let image = Uuid::new_v4();
        let raw = format!(
            "GET /images/bar HTTP/1.1\r\npool-id:{pool}\r\ndomain-id:{domain}\r\nimage-id:{image}\r\nrange:bytes=0-4095\r\n\r\n"
        );
        let (req, _) = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(
            req,
            ImageRequest::Get {
                path: "/images/bar".to_string(),
                pool,
                domain,
                image,
                range_end: 4095,
            }
        );
    }

    #[test]
    fn incomplete_request_asks_for_more_bytes() {
        let raw = b"PUT /images/foo HTTP/1.1\r\ncontent-length:10";
        assert_eq!(parse_request(raw), Err(RequestError::Incomplete));
    }

    #[test]
    fn put_without_content_length_is_rejected() {
        let raw = b"PUT /images/foo HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_request(raw),
            Err(RequestError::MissingHeader("content-length"))
        );
    }

    #[test]
    fn unsupported_verb_is_rejected() {
        let raw = b"DELETE /images/foo HTTP/1.1\r\n\r\n";
        assert_eq!(
            parse_request(raw),
            Err(RequestError::UnsupportedMethod("DELETE".to_string()))
        );
    }
}
