//! Utility module to handle the path part of an URL as a store path.
//!
//! Request paths and `Destination` headers are percent-decoded,
//! normalized (`\` becomes `/`, empty and `.` segments are dropped,
//! `..` is resolved) and stripped of the configured prefix.
//!
use std::error::Error;
use std::fmt;

use percent_encoding::{percent_decode, utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters that are escaped when a path is turned into an href.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Path of a resource or collection, relative to the handler's prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DavPath {
    path: String,
    prefix: String,
    collection: bool,
}

/// Error returned by some of the DavPath methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of prefix
    IllegalPath,
    /// too many dotdots
    ForbiddenPath,
}

impl Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.with_prefix())
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

// Resolve the segments of a decoded path. Returns the clean path (no
// trailing slash, "/" for the root) and whether a trailing slash was present.
pub(crate) fn normalize(raw: &str) -> Result<(String, bool), ParseError> {
    let raw = raw.replace('\\', "/");
    let mut segs: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segs.pop().is_none() {
                    return Err(ParseError::ForbiddenPath);
                }
            }
            s => segs.push(s),
        }
    }
    let collection = raw.ends_with('/') || raw.ends_with("/.") || raw.ends_with("/..");
    Ok((format!("/{}", segs.join("/")), collection))
}

fn decode(raw: &str) -> Result<String, ParseError> {
    percent_decode(raw.as_bytes())
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ParseError::InvalidPath)
}

// prefix without trailing slash, "" for none.
fn clean_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

/// Parent of a clean path. The root is its own parent.
pub(crate) fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl DavPath {
    /// From a clean store path.
    pub fn new(path: &str) -> Result<DavPath, ParseError> {
        let (path, collection) = normalize(path)?;
        Ok(DavPath {
            path,
            prefix: String::new(),
            collection,
        })
    }

    /// from URL encoded path and non-encoded prefix.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        if src == "*" {
            return Ok(DavPath {
                path: "*".to_string(),
                prefix: clean_prefix(prefix),
                collection: false,
            });
        }
        if !src.starts_with('/') {
            return Err(ParseError::InvalidPath);
        }
        let decoded = decode(src)?;
        let prefix = clean_prefix(prefix);
        let rest = if prefix.is_empty() {
            decoded.as_str()
        } else if decoded == prefix {
            "/"
        } else {
            match decoded.strip_prefix(&prefix) {
                Some(rest) if rest.starts_with('/') => rest,
                _ => return Err(ParseError::IllegalPath),
            }
        };
        let (path, collection) = normalize(rest)?;
        Ok(DavPath {
            path,
            prefix,
            collection,
        })
    }

    /// from request.uri
    pub fn from_uri_and_prefix(uri: &http::uri::Uri, prefix: &str) -> Result<Self, ParseError> {
        match uri.path() {
            "*" => Ok(DavPath {
                path: "*".to_string(),
                prefix: clean_prefix(prefix),
                collection: false,
            }),
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(ParseError::InvalidPath),
        }
    }

    /// From the value of a `Destination` header.
    ///
    /// Accepts an absolute URL (scheme, host and port are ignored),
    /// an absolute path, or `host[:port]/path`.
    pub fn from_destination(dest: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let dest = dest.trim();
        let path = if let Some(idx) = dest.find("://") {
            url::Url::parse(dest).map_err(|_| ParseError::InvalidPath)?;
            // the parsed path has its dot-segments resolved already, so
            // take the raw one: a ".." past the root must be refused.
            let rest = &dest[idx + 3..];
            let path = match rest.find('/') {
                Some(p) => &rest[p..],
                None => "/",
            };
            match path.find(&['?', '#'][..]) {
                Some(q) => path[..q].to_string(),
                None => path.to_string(),
            }
        } else if dest.starts_with('/') {
            dest.to_string()
        } else {
            match dest.find('/') {
                Some(idx) => dest[idx..].to_string(),
                None => return Err(ParseError::InvalidPath),
            }
        };
        DavPath::from_str_and_prefix(&path, prefix)
    }

    /// The clean path as used by the store and the lock registry.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The prefix this path was parsed with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Is this the root of the store.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Is this "*", as used by `OPTIONS *`.
    pub fn is_star(&self) -> bool {
        self.path == "*"
    }

    /// Did the request path end in a slash.
    pub fn is_collection(&self) -> bool {
        self.collection
    }

    /// Add a slash to the end of the path (if not already present).
    pub(crate) fn add_slash(&mut self) {
        self.collection = true;
    }

    /// The parent collection. The root is its own parent.
    pub fn parent(&self) -> DavPath {
        DavPath {
            path: parent_of(&self.path).to_string(),
            prefix: self.prefix.clone(),
            collection: true,
        }
    }

    /// Child path `name` below this one.
    pub fn push_segment(&self, name: &str) -> DavPath {
        let path = if self.is_root() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
            collection: false,
        }
    }

    /// Another clean store path under the same prefix.
    pub(crate) fn with_path(&self, path: &str) -> DavPath {
        DavPath {
            path: path.to_string(),
            prefix: self.prefix.clone(),
            collection: false,
        }
    }

    /// Last segment of the path, empty for the root.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    /// Is `other` strictly below this path.
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other
            .path
            .strip_prefix(&self.path)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
    }

    /// Prefix plus path, not encoded. A trailing slash is kept for collections.
    pub fn with_prefix(&self) -> String {
        let mut s = format!("{}{}", self.prefix, self.path);
        if self.collection && !s.ends_with('/') {
            s.push('/');
        }
        s
    }

    /// Prefix plus path, URL encoded, as used in `href` elements and `Location` headers.
    pub fn as_url_string(&self) -> String {
        utf8_percent_encode(&self.with_prefix(), PATH_ENCODE_SET).to_string()
    }

    /// Path relative to the store root, without the leading slash.
    pub(crate) fn as_rel_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}
