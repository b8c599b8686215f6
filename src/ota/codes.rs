//! Progress codes and bounded descriptions sent with OTA progress reports.

use core::fmt::Write as _;

/// Longest description the cloud accepts in a progress report.
pub const MAX_DESCRIPTION: usize = 128;

/// Fixed-capacity description carried next to a progress step.
pub type Description = heapless::String<MAX_DESCRIPTION>;

/// Negative progress steps reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Generic,
    Download,
    Verification,
    Program,
}

impl FailureCode {
    pub fn step(self) -> i32 {
        match self {
            Self::Generic => -1,
            Self::Download => -2,
            Self::Verification => -3,
            Self::Program => -4,
        }
    }
}

/// Download failure codes reported by the composite image downloader.
const DOWNLOAD_ERRORS: [(i32, &str); 14] = [
    (1001, "FOTA_DOMAIN_NOT_EXIST"),
    (1002, "FOTA_DOMAIN_TIMEOUT"),
    (1003, "FOTA_DOMAIN_UNKNOWN"),
    (1004, "FOTA_SERVER_CONN_FAIL"),
    (1005, "FOTA_AUTH_FAILED"),
    (1006, "FOTA_FILE_NOT_EXIST"),
    (1007, "FOTA_FILE_SIZE_INVALID"),
    (1008, "FOTA_FILE_GET_ERR"),
    (1009, "FOTA_FILE_CHECK_ERR"),
    (1010, "FOTA_INTERNAL_ERR"),
    (1011, "FOTA_NOT_INPROGRESS"),
    (1012, "FOTA_NO_MEMORY"),
    (1013, "FOTA_FILE_SIZE_TOO_LARGE"),
    (1014, "FOTA_PARAM_SIZE_INVALID"),
];

/// Name of a downloader failure code, if it is one we know.
pub fn download_error_name(code: i32) -> Option<&'static str> {
    DOWNLOAD_ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Description for a downloader failure code; unknown codes render as the number.
pub fn describe_download_error(code: i32) -> Description {
    match download_error_name(code) {
        Some(name) => bounded(name),
        None => {
            let mut out = Description::new();
            let _ = write!(out, "{code}");
            out
        }
    }
}

/// Copy `text` into a [`Description`], truncating on a char boundary.
pub fn bounded(text: &str) -> Description {
    let mut out = Description::new();
    for ch in text.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}
