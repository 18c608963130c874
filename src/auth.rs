use subtle::ConstantTimeEq;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader,
    TokenMismatch,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "missing Authorization header"),
            Self::TokenMismatch => write!(f, "bearer token mismatch"),
        }
    }
}

/// Validate `Authorization: Bearer <password>`.
///
/// An empty `password` disables the check. The comparison covers the whole
/// header value and runs in constant time for equal-length inputs.
pub fn validate_bearer(auth_header: Option<&str>, password: &str) -> Result<(), AuthError> {
    if password.is_empty() {
        return Ok(());
    }
    let header = auth_header.ok_or(AuthError::MissingHeader)?;
    let expected = format!("Bearer {}", password);

    let got = header.as_bytes();
    let want = expected.as_bytes();
    if got.len() != want.len() || got.ct_eq(want).unwrap_u8() != 1 {
        return Err(AuthError::TokenMismatch);
    }
    Ok(())
}
