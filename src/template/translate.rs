use crate::core::DbError;
use crate::driver::{
    DUPLICATE_KEY_CODE, DriverError, DriverErrorKind, TRANSIENT_TRANSACTION_LABEL,
    UNAUTHORIZED_CODE, WRITE_CONFLICT_CODE,
};

const DUPLICATE_KEY_CODES: [i32; 3] = [DUPLICATE_KEY_CODE, 11001, 12582];
const MAX_TIME_EXPIRED_CODE: i32 = 50;

/// Maps raw driver failures onto the [`DbError`] taxonomy.
///
/// Returning `None` leaves the failure untranslated; the template then
/// surfaces it unchanged as [`DbError::Driver`].
pub trait ExceptionTranslator: Send + Sync {
    fn translate(&self, error: &DriverError) -> Option<DbError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionTranslator;

impl ExceptionTranslator for DefaultExceptionTranslator {
    fn translate(&self, error: &DriverError) -> Option<DbError> {
        let message = error.message.clone();
        if let Some(code) = error.code {
            if DUPLICATE_KEY_CODES.contains(&code) {
                return Some(DbError::DuplicateKey(message));
            }
            if code == UNAUTHORIZED_CODE {
                return Some(DbError::PermissionDenied(message));
            }
            if code == WRITE_CONFLICT_CODE {
                return Some(DbError::TransientFailure(message));
            }
            if code == MAX_TIME_EXPIRED_CODE {
                return Some(DbError::QueryTimeout(message));
            }
        }
        if error.has_label(TRANSIENT_TRANSACTION_LABEL) {
            return Some(DbError::TransientFailure(message));
        }
        match error.kind {
            DriverErrorKind::Network => Some(DbError::ResourceFailure(message)),
            DriverErrorKind::Timeout => Some(DbError::QueryTimeout(message)),
            DriverErrorKind::Write => Some(DbError::DataIntegrityViolation(message)),
            DriverErrorKind::Server | DriverErrorKind::Session | DriverErrorKind::Other => None,
        }
    }
}

impl<F> ExceptionTranslator for F
where
    F: Fn(&DriverError) -> Option<DbError> + Send + Sync,
{
    fn translate(&self, error: &DriverError) -> Option<DbError> {
        self(error)
    }
}
