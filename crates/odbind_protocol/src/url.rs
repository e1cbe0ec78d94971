//! URL joining and query string encoding.

/// Characters left unescaped in query components besides ASCII
/// alphanumerics. OData expressions use these heavily.
const SAFE: &[u8] = b"-._~$(),;='/:@*!";

/// Like [`SAFE`] but without `/`, for text placed inside one path segment.
const SEGMENT_SAFE: &[u8] = b"-._~$(),;=':@*!";

/// Joins URL parts with exactly one `/` between consecutive parts.
///
/// `None` parts are skipped.
pub fn join_url<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut joined = String::new();
    let mut first = true;

    for part in parts.into_iter().flatten() {
        if first {
            joined.push_str(part);
            first = false;
            continue;
        }

        let slash_end = joined.ends_with('/');
        let slash_start = part.starts_with('/');
        match (slash_end, slash_start) {
            (true, true) => joined.push_str(&part[1..]),
            (false, false) => {
                joined.push('/');
                joined.push_str(part);
            }
            _ => joined.push_str(part),
        }
    }

    joined
}

/// Percent-encodes a query component.
pub fn encode_component(input: &str) -> String {
    encode_with(input, SAFE)
}

/// Percent-encodes text that must stay within one path segment, such as a
/// string key literal. `/`, `?`, `#`, `%` and spaces are escaped.
pub fn encode_segment(input: &str) -> String {
    encode_with(input, SEGMENT_SAFE)
}

fn encode_with(input: &str, safe: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || safe.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Decodes a percent-encoded query component. `+` decodes to a space.
///
/// Malformed escapes are kept verbatim.
pub fn decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Encodes query parameters as `name=value` pairs joined by `&`.
///
/// Parameters with an empty value are omitted.
pub fn encode_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{}={}", encode_component(name), encode_component(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Builds a full URL from a base, a resource path and query parameters.
pub fn build_url(base: &str, path: &str, params: &[(String, String)]) -> String {
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        join_url([Some(base), Some(path)])
    };
    if !params.is_empty() {
        url.push('?');
        url.push_str(&encode_query(params));
    }
    url
}
