use std::io::{Cursor, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;
use headers::Header;
use http::method::InvalidMethod;
use time::format_description::well_known::Rfc3339;
use time::macros::{format_description, offset};

use crate::errors::DavError;
use crate::DavResult;

/// HTTP Methods supported by DavHandler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DavMethod {
    Head = 0x0001,
    Get = 0x0002,
    Put = 0x0004,
    Options = 0x0008,
    PropFind = 0x0010,
    PropPatch = 0x0020,
    MkCol = 0x0040,
    Copy = 0x0080,
    Move = 0x0100,
    Delete = 0x0200,
    Lock = 0x0400,
    Unlock = 0x0800,
}

bitflags! {
    /// A set of allowed [`DavMethod`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DavMethodSet: u32 {
        const HEAD = DavMethod::Head as u32;
        const GET = DavMethod::Get as u32;
        const PUT = DavMethod::Put as u32;
        const OPTIONS = DavMethod::Options as u32;
        const PROPFIND = DavMethod::PropFind as u32;
        const PROPPATCH = DavMethod::PropPatch as u32;
        const MKCOL = DavMethod::MkCol as u32;
        const COPY = DavMethod::Copy as u32;
        const MOVE = DavMethod::Move as u32;
        const DELETE = DavMethod::Delete as u32;
        const LOCK = DavMethod::Lock as u32;
        const UNLOCK = DavMethod::Unlock as u32;

        const HTTP_RO = Self::HEAD.bits() | Self::GET.bits() | Self::OPTIONS.bits();
        const HTTP_RW = Self::HTTP_RO.bits() | Self::PUT.bits();
        const WEBDAV_RO = Self::HTTP_RO.bits() | Self::PROPFIND.bits();
    }
}

impl DavMethodSet {
    pub const WEBDAV_RW: Self = Self::all();

    /// Is this method in the set.
    pub fn contains_method(&self, m: DavMethod) -> bool {
        self.bits() & (m as u32) > 0
    }

    /// Generate a DavMethodSet from a list of words.
    pub fn from_vec(v: Vec<impl AsRef<str>>) -> Result<DavMethodSet, InvalidMethod> {
        let mut m = DavMethodSet::empty();
        for w in &v {
            m |= match w.as_ref().to_lowercase().as_str() {
                "head" => DavMethodSet::HEAD,
                "get" => DavMethodSet::GET,
                "put" => DavMethodSet::PUT,
                "options" => DavMethodSet::OPTIONS,
                "propfind" => DavMethodSet::PROPFIND,
                "proppatch" => DavMethodSet::PROPPATCH,
                "mkcol" => DavMethodSet::MKCOL,
                "copy" => DavMethodSet::COPY,
                "move" => DavMethodSet::MOVE,
                "delete" => DavMethodSet::DELETE,
                "lock" => DavMethodSet::LOCK,
                "unlock" => DavMethodSet::UNLOCK,
                "http-ro" => DavMethodSet::HTTP_RO,
                "http-rw" => DavMethodSet::HTTP_RW,
                "webdav-ro" => DavMethodSet::WEBDAV_RO,
                "webdav-rw" => DavMethodSet::WEBDAV_RW,
                _ => {
                    // A trick to get at the value of http::method::InvalidMethod.
                    let invalid_method = http::method::Method::from_bytes(b"").unwrap_err();
                    return Err(invalid_method);
                }
            };
        }
        Ok(m)
    }
}

impl DavMethod {
    /// Does this method change the store.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            DavMethod::Head | DavMethod::Get | DavMethod::Options | DavMethod::PropFind
        )
    }
}

// translate method into our own enum that has webdav methods as well.
pub(crate) fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::DELETE => DavMethod::Delete,
        http::Method::OPTIONS => DavMethod::Options,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "COPY" => DavMethod::Copy,
            "MOVE" => DavMethod::Move,
            "LOCK" => DavMethod::Lock,
            "UNLOCK" => DavMethod::Unlock,
            _ => {
                return Err(DavError::UnknownDavMethod);
            }
        },
    };
    Ok(m)
}

// for external use.
impl std::convert::TryFrom<&http::Method> for DavMethod {
    type Error = InvalidMethod;

    fn try_from(value: &http::Method) -> Result<Self, Self::Error> {
        dav_method(value).map_err(|_| {
            // A trick to get at the value of http::method::InvalidMethod.
            http::method::Method::from_bytes(b"").unwrap_err()
        })
    }
}

pub(crate) fn systemtime_to_offsetdatetime(t: SystemTime) -> time::OffsetDateTime {
    let secs = match t.duration_since(UNIX_EPOCH) {
        Ok(t) => t.as_secs() as i64,
        Err(_) => 0,
    };
    time::OffsetDateTime::from_unix_timestamp(secs)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
        .to_offset(offset!(UTC))
}

/// RFC 1123 date, as used by `Last-Modified` and `getlastmodified`.
pub(crate) fn systemtime_to_httpdate(t: SystemTime) -> String {
    let d = headers::Date::from(t);
    let mut v = Vec::new();
    d.encode(&mut v);
    v.first()
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
        .unwrap_or_default()
}

/// ISO 8601 date, as used by `creationdate`.
pub(crate) fn systemtime_to_rfc3339(t: SystemTime) -> String {
    // 1996-12-19T16:39:57Z
    systemtime_to_offsetdatetime(t)
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Short date for the html directory listing.
pub(crate) fn systemtime_to_listing(t: SystemTime) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    systemtime_to_offsetdatetime(t)
        .format(fmt)
        .unwrap_or_default()
}

pub(crate) fn systemtime_to_millis(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

// A buffer that implements "Write".
#[derive(Clone)]
pub(crate) struct MemBuffer(Cursor<Vec<u8>>);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer(Cursor::new(Vec::new()))
    }

    pub fn take(&mut self) -> Bytes {
        let buf = std::mem::take(self.0.get_mut());
        self.0.set_position(0);
        Bytes::from(buf)
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_rfc3339() {
        assert!(systemtime_to_rfc3339(UNIX_EPOCH) == "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_httpdate() {
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(systemtime_to_httpdate(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_listing_date() {
        let t = UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(systemtime_to_listing(t), "1994-11-06 08:49:37");
    }

    #[test]
    fn test_dav_method() {
        let m = http::Method::from_bytes(b"PROPFIND").unwrap();
        assert_eq!(dav_method(&m).unwrap(), DavMethod::PropFind);
        let m = http::Method::from_bytes(b"BREW").unwrap();
        assert!(dav_method(&m).is_err());
        assert!(DavMethod::Lock.is_mutating());
        assert!(!DavMethod::PropFind.is_mutating());
    }

    #[test]
    fn test_method_set() {
        let set = DavMethodSet::from_vec(vec!["GET", "head", "options"]).unwrap();
        assert_eq!(set, DavMethodSet::HTTP_RO);
        assert!(set.contains_method(DavMethod::Get));
        assert!(!set.contains_method(DavMethod::Put));
        assert!(DavMethodSet::from_vec(vec!["frobnicate"]).is_err());
    }
}
