use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid bearer token")]
    InvalidToken,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: i64,
}

/// Resolves bearer credentials to a stable buyer id.
///
/// Tokens are HS256 JWTs whose integer `sub` claim is the buyer id. The
/// purchase engine trusts the resolved id as-is.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Extracts the buyer id from an `Authorization` header value.
    pub fn buyer_id(&self, header: Option<&str>) -> Result<i64, AuthError> {
        let header = header.ok_or(AuthError::MissingToken)?;
        let (scheme, token) = header.split_once(' ').ok_or(AuthError::MissingToken)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token.trim(), &self.key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: i64,
        exp: usize,
    }

    fn token_for(secret: &str, sub: i64) -> String {
        let claims = TestClaims {
            sub,
            exp: 4_102_444_800, // 2100-01-01
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn resolves_buyer_id_from_bearer_token() {
        let verifier = TokenVerifier::new("devsecret");
        let header = format!("Bearer {}", token_for("devsecret", 42));
        assert_eq!(verifier.buyer_id(Some(&header)), Ok(42));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let verifier = TokenVerifier::new("devsecret");
        let header = format!("bearer {}", token_for("devsecret", 7));
        assert_eq!(verifier.buyer_id(Some(&header)), Ok(7));
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        let verifier = TokenVerifier::new("devsecret");
        assert_eq!(verifier.buyer_id(None), Err(AuthError::MissingToken));
        assert_eq!(
            verifier.buyer_id(Some("token-without-scheme")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            verifier.buyer_id(Some("Basic abc")),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let verifier = TokenVerifier::new("devsecret");
        let header = format!("Bearer {}", token_for("not-the-secret", 42));
        assert_eq!(verifier.buyer_id(Some(&header)), Err(AuthError::InvalidToken));
    }
}
