use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use medsum_contracts::ErrorKind;
use serde_json::Value;

mod context;
mod exchange;
mod session_cache;

pub use context::resolve_context;
pub use exchange::{SessionExchange, SessionExchangeConfig};
pub use session_cache::SessionCache;

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One site the caller holds an identity at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteIdentity {
    pub site_id: String,
    pub site_label: Option<String>,
    pub user_site_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub subject: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub roles: Vec<String>,
    pub site_identities: Vec<SiteIdentity>,
}

impl UserInfo {
    pub fn site_identity(&self, site_id: &str) -> Option<&SiteIdentity> {
        self.site_identities.iter().find(|s| s.site_id == site_id)
    }

    /// The only site identity, when the caller holds exactly one.
    pub fn default_site_identity(&self) -> Option<&SiteIdentity> {
        match self.site_identities.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationToken {
    pub raw_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

impl AuthorizationToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationToken")
            .field("raw_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            "ERR_PATIENT_REQUIRED" => ErrorKind::InvalidRequest,
            "ERR_SITE_REQUIRED" | "ERR_SITE_ACCESS_DENIED" => ErrorKind::AuthorizationGap,
            "ERR_AUTH_UNAVAILABLE" => ErrorKind::UpstreamTransient,
            "ERR_INVALID_CONFIG" | "ERR_INTERNAL" => ErrorKind::Internal,
            _ => ErrorKind::AuthenticationFailure,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.code {
            "ERR_SITE_ACCESS_DENIED" => 403,
            "ERR_PATIENT_REQUIRED" | "ERR_SITE_REQUIRED" => 400,
            "ERR_AUTH_UNAVAILABLE" => 503,
            "ERR_INVALID_CONFIG" | "ERR_INTERNAL" => 500,
            _ => 401,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
pub struct ClaimNames {
    pub site_identities: String,
    pub roles: String,
}

impl Default for ClaimNames {
    fn default() -> Self {
        Self {
            site_identities: "vistaIds".to_string(),
            roles: "vamf.auth.roles".to_string(),
        }
    }
}

/// Decodes an identity token returned by the session exchange into an
/// [`AuthorizationToken`]. Signatures are not verified.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    claims: ClaimNames,
}

impl IdentityResolver {
    pub fn new(claims: ClaimNames) -> Self {
        Self { claims }
    }

    pub fn resolve(&self, credential: &str) -> Result<Option<AuthorizationToken>, AuthError> {
        self.resolve_at(credential, Utc::now())
    }

    pub fn resolve_at(
        &self,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationToken>, AuthError> {
        let claims = decode_payload(credential)?;

        let subject = claim_string(&claims, "sub")?;
        let email = claim_string(&claims, "email")?;
        let expires_at = claim_timestamp(&claims, "exp")?;

        if now >= expires_at {
            tracing::debug!(expires_at = %expires_at, "auth.credential_expired");
            return Ok(None);
        }

        let site_identities = site_identities(&claims, &self.claims.site_identities);
        let roles = claim_string_vec(&claims, &self.claims.roles);

        Ok(Some(AuthorizationToken {
            raw_token: credential.to_string(),
            expires_at,
            user: UserInfo {
                subject,
                email,
                first_name: optional_string(&claims, "firstName"),
                last_name: optional_string(&claims, "lastName"),
                roles,
                site_identities,
            },
        }))
    }
}

/// Session credential in, authorization token out: exchange, decode, cache.
#[derive(Clone)]
pub struct Authenticator {
    exchange: SessionExchange,
    resolver: IdentityResolver,
    cache: SessionCache,
}

impl Authenticator {
    pub fn new(exchange: SessionExchange, resolver: IdentityResolver, cache: SessionCache) -> Self {
        Self {
            exchange,
            resolver,
            cache,
        }
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub async fn authenticate(&self, raw_credential: &str) -> Result<AuthorizationToken, AuthError> {
        let raw_credential = raw_credential.trim();
        if raw_credential.is_empty() {
            return Err(AuthError::new(
                "ERR_AUTH_REQUIRED",
                "session credential is missing",
            ));
        }

        let resolved = self
            .cache
            .get_or_refresh(raw_credential, || async {
                let Some(token) = self.exchange.exchange(raw_credential).await? else {
                    return Ok(None);
                };
                self.resolver.resolve(&token)
            })
            .await?;

        match resolved {
            Some(token) => {
                tracing::debug!(
                    sites = token.user.site_identities.len(),
                    "auth.session_resolved"
                );
                Ok(token)
            }
            None => Err(AuthError::new(
                "ERR_AUTH_INVALID",
                "session credential did not resolve to an identity",
            )),
        }
    }
}

fn decode_payload(credential: &str) -> Result<Value, AuthError> {
    let parts = credential.trim().split('.').collect::<Vec<_>>();
    if parts.len() != 3 {
        return Err(AuthError::new(
            "ERR_CREDENTIAL_MALFORMED",
            "credential must have three dot-separated parts",
        ));
    }

    let bytes = URL_SAFE_LENIENT.decode(parts[1]).map_err(|_| {
        AuthError::new(
            "ERR_CREDENTIAL_PAYLOAD_INVALID",
            "credential payload is not base64url",
        )
    })?;

    let claims = serde_json::from_slice::<Value>(&bytes).map_err(|_| {
        AuthError::new(
            "ERR_CREDENTIAL_PAYLOAD_INVALID",
            "credential payload is not JSON",
        )
    })?;

    if !claims.is_object() {
        return Err(AuthError::new(
            "ERR_CREDENTIAL_PAYLOAD_INVALID",
            "credential payload must be a JSON object",
        ));
    }
    Ok(claims)
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    optional_string(claims, claim).ok_or_else(|| {
        AuthError::new(
            "ERR_CREDENTIAL_CLAIM_MISSING",
            format!("required claim `{}` is missing or not a string", claim),
        )
    })
}

fn optional_string(claims: &Value, claim: &str) -> Option<String> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn claim_timestamp(claims: &Value, claim: &str) -> Result<DateTime<Utc>, AuthError> {
    let missing = || {
        AuthError::new(
            "ERR_CREDENTIAL_CLAIM_MISSING",
            format!("required claim `{}` is missing or not numeric", claim),
        )
    };

    let value = claims.get(claim).ok_or_else(missing)?;
    let secs = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(missing)?;

    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(missing)
}

fn claim_string_vec(claims: &Value, claim: &str) -> Vec<String> {
    match claims.get(claim) {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

fn site_identities(claims: &Value, claim: &str) -> Vec<SiteIdentity> {
    let Some(entries) = claims.get(claim).and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let site_id = loose_string(entry.get("siteId"))?;
            let user_site_identifier = loose_string(entry.get("duz"))?;
            Some(SiteIdentity {
                site_id,
                site_label: loose_string(entry.get("siteName")),
                user_site_identifier,
            })
        })
        .collect()
}

// Site ids and DUZ values arrive as strings or bare numbers depending on issuer.
fn loose_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn credential(claims: &Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims encode"));
        format!("eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl", payload)
    }

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    #[test]
    fn resolve_builds_token_and_drops_incomplete_site_identities() {
        let claims = serde_json::json!({
            "sub": "user-1",
            "email": "clinician@example.org",
            "exp": 1_700_003_600,
            "firstName": "Pat",
            "vamf.auth.roles": ["staff", ""],
            "vistaIds": [
                {"siteId": "530", "siteName": "Alpha", "duz": "10000000219"},
                {"siteId": "531", "siteName": "Beta"},
                {"duz": "12345"},
                {"siteId": 640, "duz": 98765}
            ]
        });

        let token = IdentityResolver::default()
            .resolve_at(&credential(&claims), now())
            .expect("resolve should succeed")
            .expect("token should not be expired");

        assert_eq!(token.user.subject, "user-1");
        assert_eq!(token.user.first_name.as_deref(), Some("Pat"));
        assert_eq!(token.user.last_name, None);
        assert_eq!(token.user.roles, vec!["staff".to_string()]);
        assert_eq!(token.user.site_identities.len(), 2);
        assert_eq!(token.user.site_identities[0].site_id, "530");
        assert_eq!(token.user.site_identities[1].site_id, "640");
        assert_eq!(token.user.site_identities[1].user_site_identifier, "98765");
        assert_eq!(
            token.expires_at,
            DateTime::<Utc>::from_timestamp(1_700_003_600, 0).expect("valid timestamp")
        );
    }

    #[test]
    fn resolve_returns_none_for_past_expiry() {
        let claims = serde_json::json!({
            "sub": "user-1",
            "email": "clinician@example.org",
            "exp": 1_699_999_000
        });

        let resolved = IdentityResolver::default()
            .resolve_at(&credential(&claims), now())
            .expect("expired credential is not an error");
        assert!(resolved.is_none());
    }

    #[test]
    fn resolve_rejects_malformed_credentials() {
        let resolver = IdentityResolver::default();

        let err = resolver.resolve_at("only.two", now()).unwrap_err();
        assert_eq!(err.code, "ERR_CREDENTIAL_MALFORMED");

        let err = resolver.resolve_at("a.!!!.c", now()).unwrap_err();
        assert_eq!(err.code, "ERR_CREDENTIAL_PAYLOAD_INVALID");

        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode(b"not json"));
        let err = resolver.resolve_at(&not_json, now()).unwrap_err();
        assert_eq!(err.code, "ERR_CREDENTIAL_PAYLOAD_INVALID");

        let no_email = credential(&serde_json::json!({"sub": "u", "exp": 1_700_003_600}));
        let err = resolver.resolve_at(&no_email, now()).unwrap_err();
        assert_eq!(err.code, "ERR_CREDENTIAL_CLAIM_MISSING");
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[test]
    fn resolve_accepts_padded_payload() {
        let claims = serde_json::json!({"sub": "u", "email": "e@x", "exp": 1_700_003_600});
        let padded = base64::engine::general_purpose::URL_SAFE
            .encode(serde_json::to_vec(&claims).expect("claims encode"));
        let token = format!("h.{}.s", padded);

        let resolved = IdentityResolver::default()
            .resolve_at(&token, now())
            .expect("padded payload decodes");
        assert!(resolved.is_some());
    }

    #[test]
    fn custom_claim_names_are_honored() {
        let claims = serde_json::json!({
            "sub": "u",
            "email": "e@x",
            "exp": 1_700_003_600,
            "sites": [{"siteId": "530", "duz": "1"}],
            "groups": "admin"
        });
        let resolver = IdentityResolver::new(ClaimNames {
            site_identities: "sites".to_string(),
            roles: "groups".to_string(),
        });

        let token = resolver
            .resolve_at(&credential(&claims), now())
            .expect("resolve should succeed")
            .expect("token present");
        assert_eq!(token.user.roles, vec!["admin".to_string()]);
        assert_eq!(
            token.user.default_site_identity().map(|s| s.site_id.as_str()),
            Some("530")
        );
    }

    #[test]
    fn debug_output_redacts_raw_token() {
        let claims = serde_json::json!({"sub": "u", "email": "e@x", "exp": 1_700_003_600});
        let raw = credential(&claims);
        let token = IdentityResolver::default()
            .resolve_at(&raw, now())
            .expect("resolve should succeed")
            .expect("token present");

        let rendered = format!("{:?}", token);
        assert!(!rendered.contains(&raw));
        assert!(rendered.contains("<redacted>"));
    }
}
