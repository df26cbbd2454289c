use std::error::Error;
use std::fmt;
use std::io::{self, ErrorKind};

use http::StatusCode;

use crate::davpath::ParseError;
use crate::store::StoreError;

#[derive(Debug)]
pub(crate) enum DavError {
    XmlReadError,  // error reading/parsing xml
    XmlParseError, // error interpreting xml
    InvalidPath,   // error parsing path
    IllegalPath,   // path not valid here
    ForbiddenPath, // too many dotdots
    UnknownDavMethod,
    Utf8Error,
    Status(StatusCode),
    StatusClose(StatusCode),
    StoreError(StoreError),
    IoError(io::Error),
    XmlReaderError(xml::reader::Error),
    XmlWriterError(xml::writer::Error),
    Panic,
}

pub(crate) type DavResult<T> = Result<T, DavError>;

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::StoreError(ref e) => Some(e),
            DavError::IoError(ref e) => Some(e),
            DavError::XmlReaderError(ref e) => Some(e),
            DavError::XmlWriterError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DavError::XmlReaderError(_) => write!(f, "XML parse error"),
            DavError::XmlWriterError(_) => write!(f, "XML generate error"),
            DavError::IoError(_) => write!(f, "I/O error"),
            DavError::StoreError(e) => write!(f, "store error: {}", e),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl From<StoreError> for DavError {
    fn from(e: StoreError) -> Self {
        DavError::StoreError(e)
    }
}

impl From<ParseError> for DavError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::InvalidPath => DavError::InvalidPath,
            ParseError::IllegalPath => DavError::IllegalPath,
            ParseError::ForbiddenPath => DavError::ForbiddenPath,
        }
    }
}

impl From<StoreError> for io::Error {
    fn from(e: StoreError) -> Self {
        let kind = match e {
            StoreError::AccessDenied => ErrorKind::PermissionDenied,
            StoreError::ObjectNotFound => ErrorKind::NotFound,
            StoreError::ObjectAlreadyExists => ErrorKind::AlreadyExists,
            StoreError::GeneralFailure => ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<StatusCode> for DavError {
    fn from(e: StatusCode) -> Self {
        DavError::Status(e)
    }
}

impl From<xml::reader::Error> for DavError {
    fn from(e: xml::reader::Error) -> Self {
        DavError::XmlReaderError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        DavError::XmlWriterError(e)
    }
}

impl From<xmltree::ParseError> for DavError {
    fn from(e: xmltree::ParseError) -> Self {
        match e {
            xmltree::ParseError::MalformedXml(e) => DavError::XmlReaderError(e),
            xmltree::ParseError::CannotParse => DavError::XmlParseError,
        }
    }
}

impl From<std::str::Utf8Error> for DavError {
    fn from(_: std::str::Utf8Error) -> Self {
        DavError::Utf8Error
    }
}

impl From<std::string::FromUtf8Error> for DavError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        DavError::Utf8Error
    }
}

/// Map a store error to the status a client should see.
pub(crate) fn storeerror_to_status(e: StoreError) -> StatusCode {
    match e {
        StoreError::AccessDenied => StatusCode::FORBIDDEN,
        StoreError::ObjectNotFound => StatusCode::NOT_FOUND,
        StoreError::ObjectAlreadyExists => StatusCode::CONFLICT,
        StoreError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ioerror_to_status(ioerror: &io::Error) -> StatusCode {
    match ioerror.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl DavError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::IllegalPath => StatusCode::BAD_GATEWAY,
            DavError::ForbiddenPath => StatusCode::FORBIDDEN,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Utf8Error => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::IoError(ref e) => ioerror_to_status(e),
            DavError::StoreError(e) => storeerror_to_status(*e),
            DavError::Status(e) => *e,
            DavError::StatusClose(e) => *e,
            DavError::XmlReaderError(ref _e) => StatusCode::BAD_REQUEST,
            DavError::XmlWriterError(ref _e) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::Panic => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn must_close(&self) -> bool {
        !matches!(
            self,
            &DavError::Status(_)
                | &DavError::StoreError(StoreError::AccessDenied)
                | &DavError::StoreError(StoreError::ObjectNotFound)
                | &DavError::StoreError(StoreError::ObjectAlreadyExists)
        )
    }

    /// Errors that leave the store in an unknown state. The transaction
    /// is rolled back instead of committed.
    pub(crate) fn is_fatal(&self) -> bool {
        match self {
            DavError::StoreError(StoreError::GeneralFailure)
            | DavError::IoError(_)
            | DavError::XmlWriterError(_)
            | DavError::Panic => true,
            DavError::Status(s) | DavError::StatusClose(s) => s.is_server_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_status() {
        let e: DavError = StoreError::AccessDenied.into();
        assert_eq!(e.statuscode(), StatusCode::FORBIDDEN);
        assert!(!e.is_fatal());
        let e: DavError = StoreError::ObjectNotFound.into();
        assert_eq!(e.statuscode(), StatusCode::NOT_FOUND);
        let e: DavError = StoreError::GeneralFailure.into();
        assert_eq!(e.statuscode(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(e.is_fatal());
    }

    #[test]
    fn status_errors_do_not_close() {
        let e: DavError = StatusCode::LOCKED.into();
        assert!(!e.must_close());
        assert!(!e.is_fatal());
        assert!(DavError::XmlParseError.must_close());
    }
}
