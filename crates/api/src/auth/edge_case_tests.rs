//! Edge Case Tests for Authentication
//!
//! Tests boundary conditions in token handling:
//! - Expiry and signature checks
//! - Claim validation
//! - Token extraction from headers and cookies

#[cfg(test)]
mod jwt_tests {
    use super::super::jwt::*;
    use time::OffsetDateTime;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn claims(sub: &str, exp_offset_secs: i64) -> Claims {
        Claims {
            sub: sub.to_string(),
            email: Some("studente@example.com".to_string()),
            exp: OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs,
            iat: None,
        }
    }

    #[test]
    fn test_valid_token_round_trip() {
        let manager = JwtManager::new(SECRET);
        let token = manager.generate_token(&claims("user_1", 3600)).unwrap();

        let decoded = manager.validate_access_token(&token).unwrap();
        assert_eq!(decoded.sub, "user_1");
        assert_eq!(decoded.email.as_deref(), Some("studente@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(SECRET);
        // Past the default 60s leeway
        let token = manager.generate_token(&claims("user_1", -3600)).unwrap();
        assert!(manager.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_token_signed_with_other_secret_rejected() {
        let issuer = JwtManager::new("another-secret");
        let token = issuer.generate_token(&claims("user_1", 3600)).unwrap();

        let manager = JwtManager::new(SECRET);
        assert!(manager.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let manager = JwtManager::new(SECRET);
        assert!(manager.validate_access_token("not.a.jwt").is_err());
        assert!(manager.validate_access_token("").is_err());
    }
}

#[cfg(test)]
mod extraction_tests {
    use super::super::middleware::*;
    use super::super::jwt::{Claims, JwtManager};
    use axum::{body::Body, extract::Request};
    use time::OffsetDateTime;

    fn request_with(header: (&str, &str)) -> Request {
        Request::builder()
            .uri("/api/user/subscription-status")
            .header(header.0, header.1)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_bearer_header_preferred() {
        let request = Request::builder()
            .header("Authorization", "Bearer header-token")
            .header("Cookie", "maturamate_auth_token=cookie-token")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            extract_bearer_token(&request).as_deref(),
            Some("header-token")
        );
    }

    #[test]
    fn test_cookie_fallback() {
        let request = request_with(("Cookie", "theme=dark; maturamate_auth_token=abc.def.ghi"));
        assert_eq!(
            extract_bearer_token(&request).as_deref(),
            Some("abc.def.ghi")
        );
    }

    #[test]
    fn test_similar_cookie_name_ignored() {
        let request = request_with(("Cookie", "maturamate_auth_token_old=stale"));
        assert!(extract_bearer_token(&request).is_none());
    }

    #[test]
    fn test_non_bearer_scheme_ignored() {
        let request = request_with(("Authorization", "Basic dXNlcjpwYXNz"));
        assert!(extract_bearer_token(&request).is_none());
    }

    #[test]
    fn test_empty_subject_rejected() {
        let state = AuthState {
            jwt_manager: JwtManager::new("secret"),
        };
        let token = state
            .jwt_manager
            .generate_token(&Claims {
                sub: "  ".to_string(),
                email: None,
                exp: OffsetDateTime::now_utc().unix_timestamp() + 600,
                iat: None,
            })
            .unwrap();

        assert!(matches!(
            authenticate_jwt(&state, &token),
            Err(AuthError::InvalidToken)
        ));
    }
}
