use medsum_contracts::{AuthorizationContext, PatientRef};

use crate::{AuthError, AuthorizationToken};

/// Scopes a resolved token to one patient at one site.
///
/// The station comes from the request, or from the caller's only site when the
/// request names none. The user-site identifier must belong to that station;
/// an identity held at a different site is never substituted.
pub fn resolve_context(
    token: &AuthorizationToken,
    patient: &PatientRef,
) -> Result<AuthorizationContext, AuthError> {
    let patient_identifier = patient
        .icn
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::new("ERR_PATIENT_REQUIRED", "patient ICN is required"))?;

    let requested_station = patient
        .station
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let station = match requested_station {
        Some(station) => station,
        None => token
            .user
            .default_site_identity()
            .map(|s| s.site_id.as_str())
            .ok_or_else(|| {
                AuthError::new(
                    "ERR_SITE_REQUIRED",
                    "no station requested and caller has no single default site",
                )
            })?,
    };

    let identity = token.user.site_identity(station).ok_or_else(|| {
        tracing::info!(station = %station, "auth.site_access_denied");
        AuthError::new(
            "ERR_SITE_ACCESS_DENIED",
            format!("caller has no identity at station {}", station),
        )
    })?;

    AuthorizationContext::new(
        token.raw_token.clone(),
        station,
        identity.user_site_identifier.clone(),
        patient_identifier,
    )
    .map_err(|reason| AuthError::new("ERR_SITE_ACCESS_DENIED", reason))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use medsum_contracts::ErrorKind;

    use super::*;
    use crate::{SiteIdentity, UserInfo};

    fn token_with_sites(sites: &[(&str, &str)]) -> AuthorizationToken {
        AuthorizationToken {
            raw_token: "raw".to_string(),
            expires_at: DateTime::<Utc>::from_timestamp(2_000_000_000, 0).expect("timestamp"),
            user: UserInfo {
                subject: "user-1".to_string(),
                email: "e@x".to_string(),
                first_name: None,
                last_name: None,
                roles: Vec::new(),
                site_identities: sites
                    .iter()
                    .map(|(site, duz)| SiteIdentity {
                        site_id: site.to_string(),
                        site_label: None,
                        user_site_identifier: duz.to_string(),
                    })
                    .collect(),
            },
        }
    }

    fn patient(icn: Option<&str>, station: Option<&str>) -> PatientRef {
        PatientRef {
            icn: icn.map(str::to_string),
            station: station.map(str::to_string),
        }
    }

    #[test]
    fn requested_station_selects_matching_identity() {
        let token = token_with_sites(&[("530", "111"), ("640", "222")]);
        let ctx = resolve_context(&token, &patient(Some("X"), Some("640")))
            .expect("context should resolve");

        assert_eq!(ctx.site_id(), "640");
        assert_eq!(ctx.user_site_identifier(), "222");
        assert_eq!(ctx.patient_identifier(), "X");
        assert_eq!(ctx.session_token(), "raw");
    }

    #[test]
    fn single_site_is_the_default_station() {
        let token = token_with_sites(&[("530", "111")]);
        let ctx = resolve_context(&token, &patient(Some("X"), None)).expect("default site");
        assert_eq!(ctx.site_id(), "530");
    }

    #[test]
    fn missing_patient_is_an_invalid_request() {
        let token = token_with_sites(&[("530", "111")]);
        let err = resolve_context(&token, &patient(Some("  "), Some("530"))).unwrap_err();
        assert_eq!(err.code, "ERR_PATIENT_REQUIRED");
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn ambiguous_station_is_an_authorization_gap() {
        let token = token_with_sites(&[("530", "111"), ("640", "222")]);
        let err = resolve_context(&token, &patient(Some("X"), None)).unwrap_err();
        assert_eq!(err.code, "ERR_SITE_REQUIRED");
        assert_eq!(err.kind(), ErrorKind::AuthorizationGap);
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn identity_at_another_site_is_never_substituted() {
        let token = token_with_sites(&[("640", "222")]);
        let err = resolve_context(&token, &patient(Some("X"), Some("530"))).unwrap_err();
        assert_eq!(err.code, "ERR_SITE_ACCESS_DENIED");
        assert_eq!(err.kind(), ErrorKind::AuthorizationGap);
        assert_eq!(err.status_code(), 403);
    }
}
