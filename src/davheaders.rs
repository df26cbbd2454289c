use std::fmt::Display;

use headers::Header;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

use crate::locks::{DEFAULT_TIMEOUT, MAX_TIMEOUT};

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    static ref IF: HeaderName = HeaderName::from_static("if");
    static ref LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");
    static ref X_LITMUS: HeaderName = HeaderName::from_static("x-litmus");
    static ref RE_LIST: Regex = Regex::new(r"\(([^)]*)\)").unwrap();
    static ref RE_COND: Regex = Regex::new(r"(Not\s+)?<([^>]*)>").unwrap();
}

const TOKEN_PREFIX: &str = "opaquelocktoken:";

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        lazy_static! {
            pub static ref $hname: HeaderName = HeaderName::from_static($sname);
        }

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                if let Ok(value) = HeaderValue::from_str(&self.0) {
                    values.extend(std::iter::once(value))
                }
            }
        }
    };
}

header!(ContentLocation, CONTENT_LOCATION, "content-location");
header!(Destination, DESTINATION, "destination");

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            v if v.eq_ignore_ascii_case(b"infinity") => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "Infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Overwrite: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let line = one(values)?;
        match line.as_bytes() {
            v if v.eq_ignore_ascii_case(b"T") => Ok(Overwrite(true)),
            v if v.eq_ignore_ascii_case(b"F") => Ok(Overwrite(false)),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One entry of the Timeout: header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DavTimeout {
    Seconds(u64),
    Infinite,
}

/// Timeout: header. Only the first (preferred) value is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout(pub DavTimeout);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let line = values.next().ok_or_else(invalid)?;
        let line = line.to_str().map_err(map_invalid)?;
        let first = line.split(',').next().unwrap_or("").trim();
        if first.eq_ignore_ascii_case("infinite") || first.eq_ignore_ascii_case("infinity") {
            return Ok(Timeout(DavTimeout::Infinite));
        }
        let secs = match first.get(..7) {
            Some(p) if p.eq_ignore_ascii_case("second-") => &first[7..],
            _ => first,
        };
        secs.parse::<u64>()
            .map(|n| Timeout(DavTimeout::Seconds(n)))
            .map_err(map_invalid)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match self.0 {
            DavTimeout::Seconds(n) => format!("Second-{}", n),
            DavTimeout::Infinite => "Infinite".to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// Lock-Token: header. Holds the bare token, without `<opaquelocktoken:` and `>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl Header for LockToken {
    fn name() -> &'static HeaderName {
        &LOCK_TOKEN
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let line = one(values)?.to_str().map_err(map_invalid)?.trim();
        let line = line
            .strip_prefix('<')
            .and_then(|l| l.strip_suffix('>'))
            .unwrap_or(line);
        let token = strip_token_prefix(line.trim());
        if token.is_empty() {
            return Err(invalid());
        }
        Ok(LockToken(token.to_string()))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = format!("<{}{}>", TOKEN_PREFIX, self.0);
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// If: header, reduced to the lock tokens it presents.
///
/// Every `<...>` condition inside a parenthesised list counts,
/// except the ones negated with `Not`. Resource tags outside of
/// the lists and ETag conditions are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct If(pub Vec<String>);

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut tokens = Vec::new();
        for value in values {
            let value = value.to_str().map_err(map_invalid)?;
            for list in RE_LIST.captures_iter(value) {
                for cond in RE_COND.captures_iter(&list[1]) {
                    if cond.get(1).is_some() {
                        continue;
                    }
                    let token = strip_token_prefix(cond[2].trim());
                    if !token.is_empty() {
                        tokens.push(token.to_string());
                    }
                }
            }
        }
        if tokens.is_empty() {
            return Err(invalid());
        }
        Ok(If(tokens))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = self
            .0
            .iter()
            .map(|t| format!("(<{}{}>)", TOKEN_PREFIX, t))
            .collect::<Vec<_>>()
            .join(" ");
        if let Ok(value) = HeaderValue::from_str(&value) {
            values.extend(std::iter::once(value));
        }
    }
}

/// X-Litmus: header, sent by the litmus test suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLitmus(pub String);

impl Header for XLitmus {
    fn name() -> &'static HeaderName {
        &X_LITMUS
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        one(values)?
            .to_str()
            .map(|t| XLitmus(t.to_owned()))
            .map_err(map_invalid)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

fn strip_token_prefix(t: &str) -> &str {
    match t.find("locktoken:") {
        Some(idx) => &t[idx + "locktoken:".len()..],
        None => t,
    }
}

/// `opaquelocktoken:ID` as used in `href` elements.
pub(crate) fn token_href(token: impl Display) -> String {
    format!("{}{}", TOKEN_PREFIX, token)
}

/// Lock timeout in seconds requested by the client.
///
/// Clamped to `[1, MAX_TIMEOUT]`, `Infinite` maps to `MAX_TIMEOUT`,
/// absent or unparsable maps to `DEFAULT_TIMEOUT`.
pub(crate) fn lock_timeout(headers: &HeaderMap) -> u64 {
    use headers::HeaderMapExt;
    match headers.typed_get::<Timeout>() {
        Some(Timeout(DavTimeout::Seconds(n))) => n.clamp(1, MAX_TIMEOUT),
        Some(Timeout(DavTimeout::Infinite)) => MAX_TIMEOUT,
        None => DEFAULT_TIMEOUT,
    }
}

/// Lock tokens presented in the If: header.
pub(crate) fn if_tokens(headers: &HeaderMap) -> Vec<String> {
    use headers::HeaderMapExt;
    headers.typed_get::<If>().map(|i| i.0).unwrap_or_default()
}

/// User-Agent, or an empty string.
pub(crate) fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get("user-agent")
        .and_then(|s| s.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use headers::HeaderMapExt;

    fn map(name: &'static str, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn depth() {
        assert_eq!(map("depth", "0").typed_get::<Depth>(), Some(Depth::Zero));
        assert_eq!(map("depth", "1").typed_get::<Depth>(), Some(Depth::One));
        assert_eq!(
            map("depth", "Infinity").typed_get::<Depth>(),
            Some(Depth::Infinity)
        );
        assert_eq!(map("depth", "2").typed_get::<Depth>(), None);
    }

    #[test]
    fn overwrite() {
        assert_eq!(
            map("overwrite", "F").typed_get::<Overwrite>(),
            Some(Overwrite(false))
        );
        assert_eq!(
            map("overwrite", "t").typed_get::<Overwrite>(),
            Some(Overwrite(true))
        );
    }

    #[test]
    fn timeout() {
        assert_eq!(lock_timeout(&HeaderMap::new()), DEFAULT_TIMEOUT);
        assert_eq!(lock_timeout(&map("timeout", "Second-120")), 120);
        assert_eq!(lock_timeout(&map("timeout", "Second-0")), 1);
        assert_eq!(lock_timeout(&map("timeout", "Second-99999999")), MAX_TIMEOUT);
        assert_eq!(lock_timeout(&map("timeout", "Infinite, Second-4100")), MAX_TIMEOUT);
        assert_eq!(lock_timeout(&map("timeout", "infinity")), MAX_TIMEOUT);
        assert_eq!(lock_timeout(&map("timeout", "300")), 300);
        assert_eq!(lock_timeout(&map("timeout", "Second-abc")), DEFAULT_TIMEOUT);
        assert_eq!(lock_timeout(&map("timeout", "soon")), DEFAULT_TIMEOUT);
    }

    #[test]
    fn lock_token() {
        let h = map("lock-token", "<opaquelocktoken:1234-abcd>");
        assert_eq!(h.typed_get::<LockToken>(), Some(LockToken("1234-abcd".into())));
        assert_eq!(map("lock-token", "<>").typed_get::<LockToken>(), None);
    }

    #[test]
    fn if_header() {
        let h = map(
            "if",
            "<http://x/y> (<opaquelocktoken:a-1> [\"etag\"]) (Not <opaquelocktoken:b-2>) (<opaquelocktoken:c-3>)",
        );
        assert_eq!(if_tokens(&h), vec!["a-1".to_string(), "c-3".to_string()]);
        assert!(if_tokens(&map("if", "([\"etag\"])")).is_empty());
        assert!(if_tokens(&HeaderMap::new()).is_empty());
    }
}
