use super::{AppError, AppState, auth::AuthCtx};
use axum::response::Response;
use axum::{
    extract::{OriginalUri, State},
    http::{Method, Request},
    middleware::Next,
};
use fbop_shared::domain::{ChildId, FamilyId, PrincipalId};
use percent_encoding::percent_decode_str;

/// What a route under `/api/v1` demands of the caller.
#[derive(Debug, PartialEq, Eq)]
enum Rule {
    /// Any signed-in principal.
    Authenticated,
    /// A parent of the family.
    Member(FamilyId),
    /// A parent, or a device registered to the child.
    MemberOrDevice(FamilyId, ChildId),
    /// A parent, or the device principal named in the path itself.
    MemberOrSelf(FamilyId, PrincipalId),
    /// Only the principal named in the path.
    OnlySelf(PrincipalId),
}

pub async fn enforce_acl(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let path = req
        .extensions()
        .get::<OriginalUri>()
        .map(|orig| orig.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().clone();
    let Some(auth) = req.extensions().get::<AuthCtx>() else {
        return Err(AppError::unauthorized());
    };
    let caller = auth.principal();

    let segs = segmented(&path);
    let ["api", "v1", rest @ ..] = segs.as_slice() else {
        tracing::warn!(?segs, "ACL: path outside api scope");
        return Err(AppError::forbidden());
    };

    let allowed = match rule_for(&method, rest) {
        Some(rule) => check(&state, &caller, rule).await?,
        None => false,
    };
    if !allowed {
        tracing::warn!(
            method = %method,
            path = %path,
            principal = %caller,
            "ACL: no rule matched; denying"
        );
        return Err(AppError::forbidden());
    }

    Ok(next.run(req).await)
}

fn rule_for(method: &Method, rest: &[&str]) -> Option<Rule> {
    let get = *method == Method::GET;
    let post = *method == Method::POST;
    let rule = match rest {
        ["auth", "me"] if get => Rule::Authenticated,
        ["auth", "logout"] if post => Rule::Authenticated,
        ["families"] if post => Rule::Authenticated,
        ["families", "mine"] if get => Rule::Authenticated,
        // The invite code itself is the credential here.
        ["families", _, "join"] if post => Rule::Authenticated,
        // So is the lookup code when a kid device registers.
        ["families", _, "children", _, "devices"] if post => Rule::Authenticated,
        ["families", f, "children", c] if get => Rule::MemberOrDevice(id(f), id(c)),
        ["families", f, "children", c, "transactions"] if get => {
            Rule::MemberOrDevice(id(f), id(c))
        }
        ["families", f, "children", c, "transactions", "watch"] if get => {
            Rule::MemberOrDevice(id(f), id(c))
        }
        ["families", f, "children", _, "devices", "watch"] if get => Rule::Member(id(f)),
        ["families", f, "children", _, "devices", p] if get => Rule::MemberOrSelf(id(f), id(p)),
        // Last-seen is the device's own heartbeat.
        ["families", _, "children", _, "devices", p, "touch"] if post => Rule::OnlySelf(id(p)),
        ["families", f, "children", _, "devices", p, "watch"] if get => {
            Rule::MemberOrSelf(id(f), id(p))
        }
        // Owner-only operations are refused again by the protocol layer.
        ["families", f, ..] => Rule::Member(id(f)),
        _ => return None,
    };
    Some(rule)
}

async fn check(state: &AppState, caller: &PrincipalId, rule: Rule) -> Result<bool, AppError> {
    let p = &state.protocols;
    let allowed = match rule {
        Rule::Authenticated => true,
        Rule::Member(f) => p.families.is_member(&f, caller).await?,
        Rule::MemberOrDevice(f, c) => {
            p.families.is_member(&f, caller).await?
                || p.devices.check_access(&f, &c, Some(caller)).await?
        }
        Rule::MemberOrSelf(f, target) => {
            &target == caller || p.families.is_member(&f, caller).await?
        }
        Rule::OnlySelf(target) => &target == caller,
    };
    Ok(allowed)
}

fn segmented(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn id<T: From<String>>(seg: &str) -> T {
    T::from(percent_decode_str(seg).decode_utf8_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(method: Method, path: &str) -> Option<Rule> {
        let segs = segmented(path);
        rule_for(&method, &segs[2..])
    }

    #[test]
    fn kid_routes_accept_devices() {
        assert_eq!(
            rule(Method::GET, "/api/v1/families/F1/children/C1/transactions/watch"),
            Some(Rule::MemberOrDevice("F1".into(), "C1".into()))
        );
        assert_eq!(
            rule(Method::POST, "/api/v1/families/F1/children/C1/devices/anon%3Ax/touch"),
            Some(Rule::OnlySelf("anon:x".into()))
        );
        assert_eq!(
            rule(Method::GET, "/api/v1/families/F1/children/C1/devices/anon%3Ax/watch"),
            Some(Rule::MemberOrSelf("F1".into(), "anon:x".into()))
        );
        assert_eq!(
            rule(Method::GET, "/api/v1/families/F1/children/C1/devices/watch"),
            Some(Rule::Member("F1".into()))
        );
    }

    #[test]
    fn writes_need_membership() {
        assert_eq!(
            rule(Method::POST, "/api/v1/families/F1/children/C1/transactions"),
            Some(Rule::Member("F1".into()))
        );
        assert_eq!(
            rule(Method::DELETE, "/api/v1/families/F1/children/C1/devices/D1"),
            Some(Rule::Member("F1".into()))
        );
        assert_eq!(
            rule(Method::POST, "/api/v1/families/F1/join"),
            Some(Rule::Authenticated)
        );
        assert_eq!(rule(Method::GET, "/api/v1/unknown"), None);
    }
}
