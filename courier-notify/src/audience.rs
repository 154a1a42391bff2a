use courier_core::store::UserDirectory;
use courier_core::{EventRole, Result, TargetRoles, UserId};
use serde_json::Value;

use crate::matrix::loose_eq;

/// Well-known event fields checked in order; the first one naming the user wins.
const ROLE_FIELDS: [(&str, EventRole); 3] = [
    ("poster_id", EventRole::Poster),
    ("acceptor_id", EventRole::Acceptor),
    ("user_id", EventRole::User),
];

/// Role of `user_id` in the event. The directory is only consulted when no
/// event field names the user.
pub async fn derive_role(
    directory: &dyn UserDirectory,
    user_id: UserId,
    event_data: &Value,
) -> Result<EventRole> {
    let user = Value::from(user_id);
    for (field, role) in ROLE_FIELDS {
        if event_data.get(field).is_some_and(|v| loose_eq(v, &user)) {
            return Ok(role);
        }
    }

    if directory.is_admin(user_id).await? {
        return Ok(EventRole::Admin);
    }
    Ok(EventRole::User)
}

pub fn admits(target_roles: &TargetRoles, role: EventRole) -> bool {
    target_roles.admits(role)
}
