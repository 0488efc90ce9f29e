use std::backtrace::Backtrace;
use rocket::http::Status;
use rocket::response::status::Custom;

pub(crate) fn status_sqlx_error(err: sqlx::Error) -> Custom<String> {
    match err {
        sqlx::Error::RowNotFound => Custom(Status::NotFound, "Record not found".to_string()),
        err => {
            error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
            Custom(Status::InternalServerError, format!("SQLx error: {}", err))
        }
    }
}
pub(crate) fn status_any_error(err: anyhow::Error) -> Custom<String> {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        if matches!(sqlx_err, sqlx::Error::RowNotFound) {
            return Custom(Status::NotFound, "Record not found".to_string());
        }
    }
    error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("Error: {}", err))
}
pub(crate) fn unprocessable(msg: impl Into<String>) -> Custom<String> {
    Custom(Status::UnprocessableEntity, msg.into())
}

/// True when the error is SQLite refusing a row because of a missing foreign key.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|e| e.is_foreign_key_violation())
}

pub(crate) fn format_price(amount: f64) -> String {
    format!("{amount:.2}")
}

#[test]
fn test_format_price() {
    assert_eq!(format_price(20.0), "20.00");
    assert_eq!(format_price(33.333), "33.33");
    assert_eq!(format_price(12.5), "12.50");
}
