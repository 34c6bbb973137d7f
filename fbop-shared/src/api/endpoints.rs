use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};

use super::{API_V1_PREFIX, family_scope};

fn base_join(base: &str, path: &str) -> String {
    let b = base.trim_end_matches('/');
    let p = path.trim_start_matches('/');
    format!("{}/{}", b, p)
}

fn enc(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

fn child_scope(family_id: &str, child_id: &str) -> String {
    format!("{}/children/{}", family_scope(family_id), enc(child_id))
}

pub fn version(base: &str) -> String {
    base_join(base, &format!("{}/version", API_V1_PREFIX))
}

pub fn auth_anonymous(base: &str) -> String {
    base_join(base, &format!("{}/auth/anonymous", API_V1_PREFIX))
}
pub fn auth_login(base: &str) -> String {
    base_join(base, &format!("{}/auth/login", API_V1_PREFIX))
}
pub fn auth_logout(base: &str) -> String {
    base_join(base, &format!("{}/auth/logout", API_V1_PREFIX))
}
pub fn auth_me(base: &str) -> String {
    base_join(base, &format!("{}/auth/me", API_V1_PREFIX))
}

pub fn invite_lookup(base: &str, code: &str) -> String {
    base_join(base, &format!("{}/invites/{}", API_V1_PREFIX, enc(code)))
}
pub fn child_lookup(base: &str, code: &str) -> String {
    base_join(base, &format!("{}/child-lookup/{}", API_V1_PREFIX, enc(code)))
}

pub fn families(base: &str) -> String {
    base_join(base, &format!("{}/families", API_V1_PREFIX))
}
pub fn my_family(base: &str) -> String {
    base_join(base, &format!("{}/families/mine", API_V1_PREFIX))
}
pub fn family(base: &str, family_id: &str) -> String {
    base_join(base, &family_scope(family_id))
}
pub fn parents(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/parents", family_scope(family_id)))
}
pub fn parent(base: &str, family_id: &str, principal_id: &str) -> String {
    base_join(
        base,
        &format!("{}/parents/{}", family_scope(family_id), enc(principal_id)),
    )
}
pub fn invites(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/invites", family_scope(family_id)))
}
pub fn join(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/join", family_scope(family_id)))
}

pub fn children(base: &str, family_id: &str) -> String {
    base_join(base, &format!("{}/children", family_scope(family_id)))
}
pub fn child(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(base, &child_scope(family_id, child_id))
}
pub fn child_lookup_codes(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(
        base,
        &format!("{}/lookup-codes", child_scope(family_id, child_id)),
    )
}

pub fn transactions(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(
        base,
        &format!("{}/transactions", child_scope(family_id, child_id)),
    )
}
pub fn transaction(base: &str, family_id: &str, child_id: &str, tx_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/transactions/{}",
            child_scope(family_id, child_id),
            enc(tx_id)
        ),
    )
}
pub fn transactions_watch(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(
        base,
        &format!("{}/transactions/watch", child_scope(family_id, child_id)),
    )
}

pub fn devices(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(base, &format!("{}/devices", child_scope(family_id, child_id)))
}
pub fn devices_watch(base: &str, family_id: &str, child_id: &str) -> String {
    base_join(
        base,
        &format!("{}/devices/watch", child_scope(family_id, child_id)),
    )
}
pub fn device(base: &str, family_id: &str, child_id: &str, principal_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/devices/{}",
            child_scope(family_id, child_id),
            enc(principal_id)
        ),
    )
}
pub fn device_touch(base: &str, family_id: &str, child_id: &str, principal_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/devices/{}/touch",
            child_scope(family_id, child_id),
            enc(principal_id)
        ),
    )
}
pub fn device_watch(base: &str, family_id: &str, child_id: &str, principal_id: &str) -> String {
    base_join(
        base,
        &format!(
            "{}/devices/{}/watch",
            child_scope(family_id, child_id),
            enc(principal_id)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_and_encodes_segments() {
        assert_eq!(
            device_touch("http://h:1/", "F 1", "C1", "anon:x"),
            "http://h:1/api/v1/families/F%201/children/C1/devices/anon%3Ax/touch"
        );
        assert_eq!(invite_lookup("http://h", "AB23XZ7K"), "http://h/api/v1/invites/AB23XZ7K");
        assert_eq!(my_family("http://h"), "http://h/api/v1/families/mine");
    }
}
