use std::{error, fmt, io, string};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive as _, ToPrimitive as _};
use picky_asn1::restricted_string::CharSetError;
use picky_asn1::wrapper::IntegerAsn1;
use picky_krb::crypto::KerberosCryptoError;

pub type Result<T> = std::result::Result<T, Error>;

/// Wire error codes carried in the `error-code` field of a KRB-ERROR message.
///
/// The values are from [RFC 4120 7.5.9](https://www.rfc-editor.org/rfc/rfc4120#section-7.5.9),
/// plus the PKINIT code from [RFC 4556 3.2.1](https://www.rfc-editor.org/rfc/rfc4556#section-3.2.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum KrbErrorCode {
    KdcErrNone = 0,
    KdcErrNameExp = 1,
    KdcErrServiceExp = 2,
    KdcErrBadPvno = 3,
    KdcErrCOldMastKvno = 4,
    KdcErrSOldMastKvno = 5,
    KdcErrCPrincipalUnknown = 6,
    KdcErrSPrincipalUnknown = 7,
    KdcErrPrincipalNotUnique = 8,
    KdcErrNullKey = 9,
    KdcErrCannotPostdate = 10,
    KdcErrNeverValid = 11,
    KdcErrPolicy = 12,
    KdcErrBadoption = 13,
    KdcErrEtypeNosupp = 14,
    KdcErrSumtypeNosupp = 15,
    KdcErrPadataTypeNosupp = 16,
    KdcErrTrtypeNosupp = 17,
    KdcErrClientRevoked = 18,
    KdcErrServiceRevoked = 19,
    KdcErrTgtRevoked = 20,
    KdcErrClientNotyet = 21,
    KdcErrServiceNotyet = 22,
    KdcErrKeyExpired = 23,
    KdcErrPreauthFailed = 24,
    KdcErrPreauthRequired = 25,
    KdcErrServerNomatch = 26,
    KdcErrMustUseUser2user = 27,
    KdcErrPathNotAccepted = 28,
    KdcErrSvcUnavailable = 29,
    KrbApErrBadIntegrity = 31,
    KrbApErrTktExpired = 32,
    KrbApErrTktNyv = 33,
    KrbApErrRepeat = 34,
    KrbApErrNotUs = 35,
    KrbApErrBadmatch = 36,
    KrbApErrSkew = 37,
    KrbApErrBadaddr = 38,
    KrbApErrBadversion = 39,
    KrbApErrMsgType = 40,
    KrbApErrModified = 41,
    KrbApErrBadorder = 42,
    KrbApErrBadkeyver = 44,
    KrbApErrNokey = 45,
    KrbApErrMutFail = 46,
    KrbApErrBaddirection = 47,
    KrbApErrMethod = 48,
    KrbApErrBadseq = 49,
    KrbApErrInappCksum = 50,
    KrbApPathNotAccepted = 51,
    KrbErrResponseTooBig = 52,
    KrbErrGeneric = 60,
    KrbErrFieldToolong = 61,
    KdcErrorClientNotTrusted = 62,
    KdcErrorKdcNotTrusted = 63,
    KdcErrorInvalidSig = 64,
    KdcErrKeyTooWeak = 65,
    KdcErrCertificateMismatch = 66,
    KrbApErrNoTgt = 67,
    KdcErrWrongRealm = 68,
    KrbApErrUserToUserRequired = 69,
    KdcErrCantVerifyCertificate = 70,
    KdcErrInvalidCertificate = 71,
    KdcErrRevokedCertificate = 72,
    KdcErrRevocationStatusUnknown = 73,
    KdcErrRevocationStatusUnavailable = 74,
    KdcErrClientNameMismatch = 75,
    KdcErrKdcNameMismatch = 76,
    KdcErrDhKeyParametersNotAccepted = 109,
}

impl KrbErrorCode {
    /// Big-endian unsigned representation for the ASN.1 `error-code` INTEGER field.
    pub fn to_wire_bytes(self) -> Vec<u8> {
        IntegerAsn1::from_bytes_be_unsigned((self as i32).to_be_bytes()[3..].to_vec()).0
    }

    /// Parses the raw `error-code` INTEGER bytes of a KRB-ERROR message.
    pub fn from_wire_bytes(raw: &[u8]) -> Option<Self> {
        let mut code: i32 = 0;
        for byte in raw.iter().take(4) {
            code = (code << 8) | i32::from(*byte);
        }
        Self::from_i32(code)
    }
}

impl fmt::Display for KrbErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.to_i32().unwrap_or_default())
    }
}

/// Classification used by the retry/propagation policy.
///
/// Only [`ErrorClass::Transport`] failures advance the transport failover loop.
/// Everything else propagates to the caller as is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorClass {
    Protocol,
    Transport,
    Integrity,
    Contract,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// The KDC answered with a well-formed KRB-ERROR.
    KdcError(KrbErrorCode),
    /// No endpoint could be discovered or configured for the target realm.
    NoEndpoints,
    ConnectionFailure,
    Timeout,
    /// The peer sent a frame whose declared length does not match what arrived.
    FrameMismatch,
    /// Checksum or decryption verification failed.
    IntegrityCheck,
    /// An authenticator was seen twice within its validity window.
    ReplayDetected,
    TimeSkew,
    UnsupportedEncryptionType,
    InvalidOperation,
    /// No handler is registered for the incoming message type.
    UnknownMessageType,
    InvalidConfiguration,
    InvalidParameter,
    MalformedMessage,
    InternalError,
}

impl ErrorKind {
    pub const fn class(self) -> ErrorClass {
        match self {
            ErrorKind::KdcError(_) => ErrorClass::Protocol,
            ErrorKind::NoEndpoints | ErrorKind::ConnectionFailure | ErrorKind::Timeout | ErrorKind::FrameMismatch => {
                ErrorClass::Transport
            }
            ErrorKind::IntegrityCheck
            | ErrorKind::ReplayDetected
            | ErrorKind::TimeSkew
            | ErrorKind::UnsupportedEncryptionType => ErrorClass::Integrity,
            ErrorKind::InvalidOperation
            | ErrorKind::UnknownMessageType
            | ErrorKind::InvalidConfiguration
            | ErrorKind::InvalidParameter
            | ErrorKind::MalformedMessage
            | ErrorKind::InternalError => ErrorClass::Contract,
        }
    }
}

/// Holds the [`ErrorKind`] and the description of the error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    pub error_type: ErrorKind,
    pub description: String,
}

impl Error {
    pub fn new(error_type: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            error_type,
            description: description.into(),
        }
    }

    /// Shorthand for an error that carries a wire-level Kerberos error code.
    pub fn krb(code: KrbErrorCode, description: impl Into<String>) -> Self {
        Self::new(ErrorKind::KdcError(code), description)
    }

    pub fn class(&self) -> ErrorClass {
        self.error_type.class()
    }

    /// The KRB-ERROR code, when this error originated from one.
    pub fn krb_error_code(&self) -> Option<KrbErrorCode> {
        match self.error_type {
            ErrorKind::KdcError(code) => Some(code),
            _ => None,
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.error_type, self.description)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let error_type = match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe => ErrorKind::ConnectionFailure,
            io::ErrorKind::UnexpectedEof => ErrorKind::FrameMismatch,
            _ => ErrorKind::InternalError,
        };

        Self::new(error_type, format!("IO error: {:?}", err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{:?}: {}", err.error_type, err.description),
        )
    }
}

impl From<picky_asn1_der::Asn1DerError> for Error {
    fn from(err: picky_asn1_der::Asn1DerError) -> Self {
        Self::new(ErrorKind::MalformedMessage, format!("ASN1 DER error: {:?}", err))
    }
}

impl From<KerberosCryptoError> for Error {
    fn from(err: KerberosCryptoError) -> Self {
        match err {
            KerberosCryptoError::IntegrityCheck => {
                Self::new(ErrorKind::IntegrityCheck, "message integrity check failed")
            }
            err => Self::new(ErrorKind::UnsupportedEncryptionType, format!("crypto error: {:?}", err)),
        }
    }
}

impl From<picky_krb::crypto::diffie_hellman::DiffieHellmanError> for Error {
    fn from(err: picky_krb::crypto::diffie_hellman::DiffieHellmanError) -> Self {
        Self::new(ErrorKind::InvalidParameter, format!("Diffie-Hellman error: {:?}", err))
    }
}

impl From<CharSetError> for Error {
    fn from(err: CharSetError) -> Self {
        Self::new(ErrorKind::InvalidParameter, format!("invalid character set: {:?}", err))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::new(ErrorKind::MalformedMessage, format!("UTF-8 error: {:?}", err))
    }
}

impl From<string::FromUtf8Error> for Error {
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(ErrorKind::MalformedMessage, format!("UTF-8 error: {:?}", err))
    }
}

impl From<string::FromUtf16Error> for Error {
    fn from(err: string::FromUtf16Error) -> Self {
        Self::new(ErrorKind::MalformedMessage, format!("UTF-16 error: {:?}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_round_trip() {
        for code in [
            KrbErrorCode::KdcErrNone,
            KrbErrorCode::KdcErrPreauthRequired,
            KrbErrorCode::KrbApErrSkew,
            KrbErrorCode::KrbErrGeneric,
            KrbErrorCode::KdcErrKdcNameMismatch,
        ] {
            let raw = code.to_wire_bytes();
            assert_eq!(KrbErrorCode::from_wire_bytes(&raw), Some(code));
        }
    }

    #[test]
    fn preauth_required_wire_value() {
        assert_eq!(KrbErrorCode::KdcErrPreauthRequired.to_wire_bytes(), vec![25]);
        assert_eq!(KrbErrorCode::from_wire_bytes(&[25]), Some(KrbErrorCode::KdcErrPreauthRequired));
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert_eq!(KrbErrorCode::from_wire_bytes(&[43]), None);
        assert_eq!(KrbErrorCode::from_wire_bytes(&[]), None);
    }

    #[test]
    fn transport_classification_drives_failover() {
        assert_eq!(ErrorKind::ConnectionFailure.class(), ErrorClass::Transport);
        assert_eq!(ErrorKind::Timeout.class(), ErrorClass::Transport);
        assert_eq!(
            ErrorKind::KdcError(KrbErrorCode::KdcErrPreauthRequired).class(),
            ErrorClass::Protocol
        );
        assert_eq!(ErrorKind::ReplayDetected.class(), ErrorClass::Integrity);
        assert_eq!(ErrorKind::UnknownMessageType.class(), ErrorClass::Contract);
    }

    #[test]
    fn io_error_mapping() {
        let err: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(err.error_type, ErrorKind::ConnectionFailure);

        let err: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(err.error_type, ErrorKind::Timeout);

        let err: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err.error_type, ErrorKind::FrameMismatch);
    }
}
